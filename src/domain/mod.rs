pub mod health;
pub mod host;
pub mod host_state;
pub mod jobs;
pub mod limiter;
pub mod pipeline;
pub mod preflight;
pub mod reboot;
pub mod rollout;
pub mod state_store;
pub mod window;
