use mm_settings::Settings;

const DEFAULT_NLISTENERS: u32 = 1;
const DEFAULT_DISPATCH_QUEUE_SIZE: u32 = 1024;
const DEFAULT_LISTENER_QUEUE_SIZE: u32 = 1024;
const DEFAULT_LOCK_SPIN_LIMIT: u32 = 40;
const DEFAULT_POLL_SPIN_LIMIT: u32 = 40;

const MIN_QUEUE_SIZE: u32 = 16;

fn round_queue_size(requested: u32) -> u32 {
    requested.max(MIN_QUEUE_SIZE).next_power_of_two()
}

/// Runtime-wide tuning knobs. Construct with [`ConfigBuilder`] or load from
/// an already-parsed [`Settings`] document via [`Config::from_settings`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) nlisteners: u32,
    /// Reserved: the cross-strand async queue capacity is currently fixed
    /// by `listener_queue_size` alone (`mm_event::Dispatcher` has one
    /// queue-capacity parameter per listener, not a separate dispatch-wide
    /// one). Accepted and stored so a future dispatcher revision with a
    /// distinct dispatch-wide queue can pick it up without a config
    /// surface change.
    pub(crate) dispatch_queue_size: u32,
    pub(crate) listener_queue_size: u32,
    pub(crate) lock_spin_limit: u32,
    pub(crate) poll_spin_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn nlisteners(&self) -> u32 {
        self.nlisteners
    }

    pub fn listener_queue_size(&self) -> u32 {
        self.listener_queue_size
    }

    pub fn lock_spin_limit(&self) -> u32 {
        self.lock_spin_limit
    }

    pub fn poll_spin_limit(&self) -> u32 {
        self.poll_spin_limit
    }

    /// Load a `Config` from a flat settings document. Keys not present
    /// fall back to the builder defaults.
    pub fn from_settings(settings: &Settings) -> Self {
        ConfigBuilder::new()
            .nlisteners(settings.get_u32("nlisteners", DEFAULT_NLISTENERS))
            .dispatch_queue_size(settings.get_u32("dispatch_queue_size", DEFAULT_DISPATCH_QUEUE_SIZE))
            .listener_queue_size(settings.get_u32("listener_queue_size", DEFAULT_LISTENER_QUEUE_SIZE))
            .lock_spin_limit(settings.get_u32("lock_spin_limit", DEFAULT_LOCK_SPIN_LIMIT))
            .poll_spin_limit(settings.get_u32("poll_spin_limit", DEFAULT_POLL_SPIN_LIMIT))
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigBuilder {
    nlisteners: u32,
    dispatch_queue_size: u32,
    listener_queue_size: u32,
    lock_spin_limit: u32,
    poll_spin_limit: u32,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            nlisteners: DEFAULT_NLISTENERS,
            dispatch_queue_size: DEFAULT_DISPATCH_QUEUE_SIZE,
            listener_queue_size: DEFAULT_LISTENER_QUEUE_SIZE,
            lock_spin_limit: DEFAULT_LOCK_SPIN_LIMIT,
            poll_spin_limit: DEFAULT_POLL_SPIN_LIMIT,
        }
    }

    pub fn nlisteners(mut self, n: u32) -> Self {
        self.nlisteners = n.max(1);
        self
    }

    pub fn dispatch_queue_size(mut self, n: u32) -> Self {
        self.dispatch_queue_size = round_queue_size(n);
        self
    }

    pub fn listener_queue_size(mut self, n: u32) -> Self {
        self.listener_queue_size = round_queue_size(n);
        self
    }

    pub fn lock_spin_limit(mut self, n: u32) -> Self {
        self.lock_spin_limit = n;
        self
    }

    pub fn poll_spin_limit(mut self, n: u32) -> Self {
        self.poll_spin_limit = n;
        self
    }

    pub fn build(self) -> Config {
        Config {
            nlisteners: self.nlisteners,
            dispatch_queue_size: self.dispatch_queue_size,
            listener_queue_size: self.listener_queue_size,
            lock_spin_limit: self.lock_spin_limit,
            poll_spin_limit: self.poll_spin_limit,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_sizes_round_up_to_a_power_of_two_no_smaller_than_the_minimum() {
        let cfg = ConfigBuilder::new().listener_queue_size(5).build();
        assert_eq!(cfg.listener_queue_size(), MIN_QUEUE_SIZE);

        let cfg = ConfigBuilder::new().listener_queue_size(1000).build();
        assert_eq!(cfg.listener_queue_size(), 1024);
    }

    #[test]
    fn nlisteners_is_never_rounded_down_to_zero() {
        let cfg = ConfigBuilder::new().nlisteners(0).build();
        assert_eq!(cfg.nlisteners(), 1);
    }

    #[test]
    fn from_settings_reads_overrides_and_falls_back_for_the_rest() {
        let mut settings = Settings::new();
        settings.set("nlisteners", "4");
        settings.set("lock_spin_limit", "100");

        let cfg = Config::from_settings(&settings);
        assert_eq!(cfg.nlisteners(), 4);
        assert_eq!(cfg.lock_spin_limit(), 100);
        assert_eq!(cfg.poll_spin_limit(), DEFAULT_POLL_SPIN_LIMIT);
    }
}
