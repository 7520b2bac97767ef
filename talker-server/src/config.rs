//! Server configuration, parsed from the command line.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "talker-server", about = "Line-oriented talker server with a flooding peer mesh")]
pub struct ServerConfig {
    /// Address of the client listener (host:port).
    #[arg(long, default_value = "127.0.0.1:8889")]
    pub listen: String,

    /// Address of the peer listener. Peer listeners can also be opened at
    /// runtime with /peer-listen.
    #[arg(long)]
    pub peer_listen: Option<String>,

    /// Outbound peer to dial at startup (repeatable).
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Fixed server id as 32 hex characters. Random when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Capacity of the duplicate-suppression cache.
    #[arg(long, default_value_t = 10_000)]
    pub seen_capacity: usize,

    /// Interval between peer-set refresh broadcasts, in seconds.
    #[arg(long, default_value_t = 30)]
    pub refresh_secs: u64,

    /// Route entries that go this long without a refresh are pruned (seconds).
    #[arg(long, default_value_t = 300)]
    pub stale_secs: u64,

    /// Maximum length of a single wire record, in bytes.
    #[arg(long, default_value_t = 65_536)]
    pub max_record_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            peer_listen: None,
            peers: Vec::new(),
            id: None,
            seen_capacity: 10_000,
            refresh_secs: 30,
            stale_secs: 300,
            max_record_len: 65_536,
        }
    }
}
