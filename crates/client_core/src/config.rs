use std::time::Duration;

use media_engine::IceServer;

/// Tunables for one synchronization session. Every value has a usable
/// default; deployments override through `PARLEY__*` environment variables.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub heartbeat_interval: Duration,
    pub activity_window: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub match_window: Duration,
    pub history_page_size: u32,
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    pub ice_queue_cap: usize,
    pub ring_timeout: Duration,
    pub media_error_grace: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            activity_window: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 10,
            match_window: Duration::from_secs(5),
            history_page_size: 50,
            typing_ttl: Duration::from_secs(6),
            typing_sweep_interval: Duration::from_secs(2),
            ice_queue_cap: 64,
            ring_timeout: Duration::from_secs(45),
            media_error_grace: Duration::from_secs(2),
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            }],
        }
    }
}

pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();

    override_duration_ms("PARLEY__HEARTBEAT_MS", &mut settings.heartbeat_interval);
    override_duration_ms("PARLEY__ACTIVITY_WINDOW_MS", &mut settings.activity_window);
    override_duration_ms("PARLEY__HANDSHAKE_TIMEOUT_MS", &mut settings.handshake_timeout);
    override_duration_ms("PARLEY__RECONNECT_BASE_MS", &mut settings.reconnect_base_delay);
    override_duration_ms("PARLEY__RECONNECT_MAX_MS", &mut settings.reconnect_max_delay);
    override_duration_ms("PARLEY__MATCH_WINDOW_MS", &mut settings.match_window);
    override_duration_ms("PARLEY__TYPING_TTL_MS", &mut settings.typing_ttl);
    override_duration_ms("PARLEY__TYPING_SWEEP_MS", &mut settings.typing_sweep_interval);
    override_duration_ms("PARLEY__RING_TIMEOUT_MS", &mut settings.ring_timeout);
    override_duration_ms("PARLEY__MEDIA_ERROR_GRACE_MS", &mut settings.media_error_grace);

    if let Ok(v) = std::env::var("PARLEY__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect_max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("PARLEY__HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
    if let Ok(v) = std::env::var("PARLEY__ICE_QUEUE_CAP") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.ice_queue_cap = parsed;
        }
    }
    if let Ok(v) = std::env::var("PARLEY__ICE_SERVERS") {
        let urls: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !urls.is_empty() {
            settings.ice_servers = vec![IceServer {
                urls,
                username: None,
                credential: None,
            }];
        }
    }

    settings
}

fn override_duration_ms(name: &str, target: &mut Duration) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<u64>() {
            *target = Duration::from_millis(parsed);
        }
    }
}
