use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;

bitflags! {
    /// Fault injection for testing. A `NO_*` flag suppresses sending that handshake message,
    ///  everything else proceeds as if it had been sent.
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct TestBits: u32 {
        /// keep a ring of recent controller events for inspection
        const DEBUG   = 0x0000_0001;
        const NO_CREQ = 0x0000_0002;
        const NO_CRSP = 0x0000_0004;
        const NO_COK  = 0x0000_0008;
        const NO_DREQ = 0x0000_0010;
        const NO_DRSP = 0x0000_0020;
        const NO_DOK  = 0x0000_0040;
    }
}

#[derive(Debug, Clone)]
pub struct CtConfig {
    pub test_bits: TestBits,
    /// transport domain this process lives in, part of its handshake address
    pub domain_id: Option<u32>,
    /// delay between a receiver discovering a source and sending the first connect request
    pub delay_creq: Duration,
    pub retry_ivl: Duration,
    /// number of attempts for each handshake step before giving up
    pub max_tries: u32,
    /// deliver received data to the application before the connect handshake completes
    pub pre_delivery: bool,
}

impl Default for CtConfig {
    fn default() -> Self {
        CtConfig::new()
    }
}

impl CtConfig {
    pub fn new() -> CtConfig {
        CtConfig {
            test_bits: TestBits::empty(),
            domain_id: None,
            delay_creq: Duration::from_millis(10),
            retry_ivl: Duration::from_millis(1000),
            max_tries: 5,
            pre_delivery: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_tries == 0 {
            bail!("max_tries must be at least 1");
        }
        if self.retry_ivl.is_zero() {
            bail!("retry_ivl must be positive");
        }
        if self.delay_creq > self.retry_ivl {
            bail!("delay_creq ({:?}) must not exceed retry_ivl ({:?})", self.delay_creq, self.retry_ivl);
        }
        Ok(())
    }

    pub fn is_suppressed(&self, flag: TestBits) -> bool {
        self.test_bits.contains(flag)
    }
}
