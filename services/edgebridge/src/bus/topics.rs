//! Topic naming: `{prefix}/{deviceId}/{kind}`

/// Topic names for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub status: String,
    pub alerts: String,
    pub commands: String,
    pub command_response: String,
    pub cancel: String,
    pub cancel_response: String,
    pub broadcast_commands: String,
}

impl Topics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let device = |kind: &str| format!("{}/{}/{}", prefix, device_id, kind);
        Self {
            data: device("data"),
            status: device("status"),
            alerts: device("alerts"),
            commands: device("commands"),
            command_response: device("commands/response"),
            cancel: device("commands/cancel"),
            cancel_response: device("commands/cancel/response"),
            broadcast_commands: format!("{}/broadcast/commands", prefix),
        }
    }

    /// Topics the bridge subscribes to
    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.commands, &self.broadcast_commands, &self.cancel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_device_topics() {
        let topics = Topics::new("nattery/", "inverter-001");
        assert_eq!(topics.data, "nattery/inverter-001/data");
        assert_eq!(topics.command_response, "nattery/inverter-001/commands/response");
        assert_eq!(topics.cancel, "nattery/inverter-001/commands/cancel");
        assert_eq!(topics.broadcast_commands, "nattery/broadcast/commands");
        assert_eq!(topics.subscriptions().len(), 3);
    }
}
