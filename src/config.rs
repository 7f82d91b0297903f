// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration.
//!
//! `Config` is a plain struct the embedding application populates; there is
//! no CLI or environment-variable parsing here, by design.

use std::time::Duration;

/// Client reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectPolicy {
    /// Never reconnect automatically; the caller observes the disconnect.
    NoRetry,
    /// Always wait a fixed delay before attempting to reconnect.
    FixedDelay(Duration),
    /// Exponential backoff between `base` and `cap`, with up to `jitter`
    /// of random slack added to each attempt.
    ExponentialBackoff {
        /// Initial delay.
        base: Duration,
        /// Ceiling the delay never exceeds.
        cap: Duration,
        /// Maximum jitter added on top of the computed delay.
        jitter: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::NoRetry
    }
}

/// Recognised configuration options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker count. `0` is rejected at [`crate::iosystem::IOSystem::new`].
    pub num_workers: usize,
    /// Per-connection read buffer size, in KiB.
    pub read_buffer_kb: usize,
    /// Per-connection scratch buffer used to stage socket writes, in KiB.
    pub write_buffer_kb: usize,
    /// Backpressure high-water mark: queued-response depth at which read
    /// interest is suppressed.
    pub pipeline_high: usize,
    /// Backpressure low-water mark: queued-response depth at which read
    /// interest is restored.
    pub pipeline_low: usize,
    /// Idle-connection timeout. `None` disables idle timeouts entirely.
    pub connection_idle_timeout: Option<Duration>,
    /// Default client request deadline.
    pub request_timeout: Duration,
    /// Client reconnection policy.
    pub reconnect_policy: ReconnectPolicy,
    /// Listener backlog depth passed to `listen(2)`.
    pub accept_backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            read_buffer_kb: 64,
            write_buffer_kb: 16,
            pipeline_high: 128,
            pipeline_low: 32,
            connection_idle_timeout: Some(Duration::from_secs(60)),
            request_timeout: Duration::from_secs(5),
            reconnect_policy: ReconnectPolicy::NoRetry,
            accept_backlog: 1024,
        }
    }
}

impl Config {
    /// Start building a [`Config`] from defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }

    /// Validate the watermark and worker-count invariants. Called by
    /// `IOSystem::new`; exposed so tests and embedders can check eagerly.
    pub fn validate(&self) -> Result<(), crate::error::ColossusError> {
        if self.num_workers == 0 {
            return Err(crate::error::ColossusError::Config(
                "num_workers must be >= 1".into(),
            ));
        }
        if self.pipeline_low >= self.pipeline_high {
            return Err(crate::error::ColossusError::Config(format!(
                "pipeline_low ({}) must be less than pipeline_high ({})",
                self.pipeline_low, self.pipeline_high
            )));
        }
        if self.read_buffer_kb == 0 || self.write_buffer_kb == 0 {
            return Err(crate::error::ColossusError::Config(
                "read_buffer_kb and write_buffer_kb must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    /// Set the worker count.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.0.num_workers = n;
        self
    }

    /// Set the per-connection read buffer size, in KiB.
    pub fn read_buffer_kb(mut self, kb: usize) -> Self {
        self.0.read_buffer_kb = kb;
        self
    }

    /// Set the per-connection write scratch size, in KiB.
    pub fn write_buffer_kb(mut self, kb: usize) -> Self {
        self.0.write_buffer_kb = kb;
        self
    }

    /// Set the backpressure watermarks.
    pub fn pipeline_watermarks(mut self, low: usize, high: usize) -> Self {
        self.0.pipeline_low = low;
        self.0.pipeline_high = high;
        self
    }

    /// Set the idle connection timeout.
    pub fn connection_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.0.connection_idle_timeout = timeout;
        self
    }

    /// Set the default client request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.0.request_timeout = timeout;
        self
    }

    /// Set the client reconnection policy.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.0.reconnect_policy = policy;
        self
    }

    /// Set the listen backlog.
    pub fn accept_backlog(mut self, backlog: u32) -> Self {
        self.0.accept_backlog = backlog;
        self
    }

    /// Finish building, validating watermark and worker-count invariants.
    pub fn build(self) -> Result<Config, crate::error::ColossusError> {
        self.0.validate()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_rejected() {
        let err = Config::builder().num_workers(0).build().unwrap_err();
        assert!(matches!(err, crate::error::ColossusError::Config(_)));
    }

    #[test]
    fn watermarks_must_be_ordered() {
        let err = Config::builder()
            .pipeline_watermarks(100, 50)
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::error::ColossusError::Config(_)));
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }
}
