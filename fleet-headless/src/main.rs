fn main() {
    if let Err(err) = charging_fleet::app::run_headless() {
        eprintln!("headless fleet startup failed: {err}");
        std::process::exit(1);
    }
}
