pub const TOPIC_ROOT: &str = "home";
pub const VALVES_SEGMENT: &str = "valves";
pub const THERMOSTAT_SEGMENT: &str = "thermostat";

pub const TOPIC_FILTER_TEMPERATURE: &str = "home/valves/+/temperature";
pub const TOPIC_FILTER_SETPOINT: &str = "home/thermostat/setpoint/+";
pub const TOPIC_FILTER_COMMAND: &str = "home/valves/+/command";

pub fn temperature_topic(valve_id: &str) -> String {
    format!("{TOPIC_ROOT}/{VALVES_SEGMENT}/{valve_id}/temperature")
}

pub fn command_topic(valve_id: &str) -> String {
    format!("{TOPIC_ROOT}/{VALVES_SEGMENT}/{valve_id}/command")
}

pub fn announce_topic(valve_id: &str) -> String {
    format!("{TOPIC_ROOT}/{VALVES_SEGMENT}/{valve_id}/announce")
}

pub fn setpoint_topic(valve_id: &str) -> String {
    format!("{TOPIC_ROOT}/{THERMOSTAT_SEGMENT}/setpoint/{valve_id}")
}

/// Classification of an inbound topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Temperature(&'a str),
    Setpoint(&'a str),
    /// Belongs to a routed family but has the wrong shape.
    Malformed,
    Unrelated,
}

impl<'a> InboundTopic<'a> {
    pub fn parse(topic: &'a str) -> Self {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 2 || parts[0] != TOPIC_ROOT {
            return Self::Unrelated;
        }

        match parts[1] {
            VALVES_SEGMENT => match parts.as_slice() {
                [_, _, id, "temperature"] if !id.is_empty() => Self::Temperature(*id),
                [_, _, _, "temperature"] => Self::Malformed,
                // Commands and announcements share the prefix but are outbound.
                [_, _, _, _] => Self::Unrelated,
                _ => Self::Malformed,
            },
            THERMOSTAT_SEGMENT => match parts.as_slice() {
                [_, _, "setpoint", id] if !id.is_empty() => Self::Setpoint(*id),
                [_, _, "setpoint", ..] => Self::Malformed,
                _ => Self::Unrelated,
            },
            _ => Self::Unrelated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_round_trip_through_parse() {
        assert_eq!(
            InboundTopic::parse(&temperature_topic("v1")),
            InboundTopic::Temperature("v1")
        );
        assert_eq!(
            InboundTopic::parse(&setpoint_topic("kitchen-2")),
            InboundTopic::Setpoint("kitchen-2")
        );
        assert_eq!(InboundTopic::parse(&command_topic("v1")), InboundTopic::Unrelated);
        assert_eq!(InboundTopic::parse(&announce_topic("v1")), InboundTopic::Unrelated);
    }

    #[test]
    fn wrong_segment_count_is_malformed() {
        assert_eq!(
            InboundTopic::parse("home/valves/v1/temperature/extra"),
            InboundTopic::Malformed
        );
        assert_eq!(InboundTopic::parse("home/valves/v1"), InboundTopic::Malformed);
        assert_eq!(
            InboundTopic::parse("home/thermostat/setpoint"),
            InboundTopic::Malformed
        );
        assert_eq!(
            InboundTopic::parse("home/valves//temperature"),
            InboundTopic::Malformed
        );
    }

    #[test]
    fn foreign_topics_are_unrelated() {
        assert_eq!(InboundTopic::parse("office/valves/v1/temperature"), InboundTopic::Unrelated);
        assert_eq!(InboundTopic::parse("home/lights/l1/state"), InboundTopic::Unrelated);
        assert_eq!(InboundTopic::parse("home"), InboundTopic::Unrelated);
        assert_eq!(InboundTopic::parse("home/valves/v1/battery"), InboundTopic::Unrelated);
        assert_eq!(InboundTopic::parse("home/thermostat/mode"), InboundTopic::Unrelated);
    }
}
