//! Metrics tracking for the relay server

/// Server counters, reported periodically to the log
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    /// Current number of connected clients
    pub connected_clients: usize,
    /// Total connections since start
    pub total_connections: u64,
    /// Peak simultaneous connections
    pub peak_connections: usize,
    /// Current number of active sessions
    pub active_sessions: usize,
    /// Total sessions created since start
    pub total_sessions: u64,
    /// Events fanned out to listeners since start
    pub events_forwarded: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_connected(&mut self) {
        self.connected_clients += 1;
        self.total_connections += 1;
        self.peak_connections = self.peak_connections.max(self.connected_clients);
    }

    pub fn client_disconnected(&mut self) {
        self.connected_clients = self.connected_clients.saturating_sub(1);
    }

    pub fn session_created(&mut self) {
        self.total_sessions += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "clients={} (peak {}, total {}), sessions={} (total {}), forwarded={}",
            self.connected_clients,
            self.peak_connections,
            self.total_connections,
            self.active_sessions,
            self.total_sessions,
            self.events_forwarded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let mut metrics = Metrics::new();

        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        metrics.client_connected();

        assert_eq!(metrics.connected_clients, 2);
        assert_eq!(metrics.total_connections, 3);
        assert_eq!(metrics.peak_connections, 2);

        metrics.client_disconnected();
        metrics.client_disconnected();
        metrics.client_disconnected();
        assert_eq!(metrics.connected_clients, 0);
    }
}
