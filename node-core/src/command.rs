/// Device-control commands carried by the [`CommandBus`](crate::bus::CommandBus).
///
/// Commands are plain values: produced by a session, copied through the bus and
/// consumed exactly once by the device-control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    LedOn,
    LedOff,
    /// Marker posted when a firmware transfer begins. The transfer itself is
    /// driven by the session, not by the consumer.
    OtaStart,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::LedOn => "led_on",
            Command::LedOff => "led_off",
            Command::OtaStart => "ota_start",
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_names_match_wire_keywords() {
        assert_eq!(Command::LedOn.name(), "led_on");
        assert_eq!(Command::LedOff.to_string(), "led_off");
    }
}
