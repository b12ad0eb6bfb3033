pub const ALL_STATION_EVENTS: &str = "charging/+/events";
pub const ALL_STATION_STATUS: &str = "charging/+/status";
pub const TRANSACTIONS: &str = "billing/transactions";

const STATION_PREFIX: &str = "charging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    StationEvents,
    StationStatus,
    Transactions,
}

pub fn events_topic(station_id: &str) -> String {
    format!("{STATION_PREFIX}/{station_id}/events")
}

pub fn status_topic(station_id: &str) -> String {
    format!("{STATION_PREFIX}/{station_id}/status")
}

/// A station id becomes one topic level, so it must be non-empty and free of
/// level separators and wildcards.
pub fn is_valid_station_id(station_id: &str) -> bool {
    !station_id.is_empty() && !station_id.contains(['/', '+', '#'])
}

/// Returns the station segment of a `charging/{id}/...` topic.
pub fn station_of(topic: &str) -> Option<&str> {
    let mut levels = topic.split('/');
    match (levels.next(), levels.next(), levels.next(), levels.next()) {
        (Some(STATION_PREFIX), Some(station), Some(_), None) if !station.is_empty() => {
            Some(station)
        }
        _ => None,
    }
}

pub fn classify(topic: &str) -> Option<TopicKind> {
    if topic == TRANSACTIONS {
        return Some(TopicKind::Transactions);
    }

    station_of(topic)?;
    match topic.rsplit('/').next() {
        Some("events") => Some(TopicKind::StationEvents),
        Some("status") => Some(TopicKind::StationStatus),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{TopicKind, classify, events_topic, is_valid_station_id, station_of, status_topic};

    #[test]
    fn station_ids_must_be_single_plain_levels() {
        assert!(is_valid_station_id("A"));
        assert!(is_valid_station_id("north-1"));
        assert!(!is_valid_station_id(""));
        assert!(!is_valid_station_id("a/b"));
        assert!(!is_valid_station_id("+"));
        assert!(!is_valid_station_id("#"));
    }

    #[test]
    fn builds_station_topics() {
        assert_eq!(events_topic("A"), "charging/A/events");
        assert_eq!(status_topic("A"), "charging/A/status");
    }

    #[test]
    fn extracts_station_from_topic() {
        assert_eq!(station_of("charging/A/events"), Some("A"));
        assert_eq!(station_of("charging//events"), None);
        assert_eq!(station_of("billing/transactions"), None);
        assert_eq!(station_of("charging/A/events/extra"), None);
    }

    #[test]
    fn classifies_known_topics() {
        assert_eq!(
            classify("charging/A/events"),
            Some(TopicKind::StationEvents)
        );
        assert_eq!(
            classify("charging/B/status"),
            Some(TopicKind::StationStatus)
        );
        assert_eq!(
            classify("billing/transactions"),
            Some(TopicKind::Transactions)
        );
        assert_eq!(classify("charging/B/unknown"), None);
    }
}
