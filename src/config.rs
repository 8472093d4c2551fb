/// Process-wide receiver settings. Built once in `main` from the command
/// line, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub port: u16,
    /// Enables RTSP digest authentication when set.
    pub password: Option<String>,
    pub hw_addr: [u8; 6],
    /// Session timeout in seconds. Zero lets a newly arriving source
    /// pre-empt the one currently announced.
    pub session_timeout: u32,
    /// Latencies in frames, selected per source type at SETUP.
    pub itunes_latency: u32,
    pub airplay_latency: u32,
    pub forked_daapd_latency: u32,
    pub default_latency: u32,
    /// Explicit override; wins over the per-source selection.
    pub user_latency: Option<u32>,
}
