pub mod random;
pub mod recent_events;
pub mod retry_timer;
