//! Server configuration from CLI flags and environment.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "lanlink-server",
    about = "Centralized rendezvous server for the LAN-party control plane",
    version
)]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "LANLINK_LISTEN_ADDR", default_value = "0.0.0.0:8537")]
    pub listen_addr: String,

    /// SQLite database path.
    #[arg(long, env = "LANLINK_DATABASE_PATH", default_value = "lanlink.db")]
    pub database_path: String,

    /// Auth token lifetime in seconds.
    #[arg(long, env = "LANLINK_TOKEN_TTL", default_value_t = 86_400)]
    pub token_ttl: u64,

    /// Seconds between reaper passes.
    #[arg(long, env = "LANLINK_REAPER_INTERVAL", default_value_t = 60)]
    pub reaper_interval: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = ServerConfig::parse_from(["lanlink-server"]);
        assert_eq!(config.listen_addr, "0.0.0.0:8537");
        assert_eq!(config.token_ttl, 86_400);
        assert_eq!(config.reaper_interval, 60);
    }

    #[test]
    fn staleness_windows_are_not_flags() {
        assert!(ServerConfig::try_parse_from(["lanlink-server", "--stale-ttl", "10"]).is_err());
        assert!(ServerConfig::try_parse_from(["lanlink-server", "--relay-ttl", "10"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::parse_from([
            "lanlink-server",
            "--listen-addr",
            "127.0.0.1:0",
            "--database-path",
            "/tmp/test.db",
            "--token-ttl",
            "60",
        ]);
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.database_path, "/tmp/test.db");
        assert_eq!(config.token_ttl, 60);
    }
}
