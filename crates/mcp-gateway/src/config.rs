use std::time::Duration;

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session stays valid after creation. Expiry is checked
    /// lazily on access, there is no background sweeper.
    pub ttl: Duration,
}

impl SessionConfig {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Self::DEFAULT_TTL,
        }
    }
}

/// Reconnect policy for upstream event streams.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct StreamRetryConfig {
    pub max_times: Option<usize>,
    pub min_duration: Duration,
}

impl StreamRetryConfig {
    pub const DEFAULT_MIN_DURATION: Duration = Duration::from_millis(1000);
}

impl Default for StreamRetryConfig {
    fn default() -> Self {
        Self {
            max_times: Some(3),
            min_duration: Self::DEFAULT_MIN_DURATION,
        }
    }
}

/// Settings shared by the four transport adapters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the client-facing event channel and of the per-connection
    /// outbound message queue.
    pub channel_buffer_capacity: usize,
    /// Capacity of the bounded line queue between the streamable HTTP reader
    /// and the drain loop.
    pub line_queue_capacity: usize,
    /// How long a closing STDIO connection waits for the child to exit
    /// before it is killed.
    pub stdio_shutdown_grace: Duration,
    pub retry: StreamRetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_buffer_capacity: 64,
            line_queue_capacity: 256,
            stdio_shutdown_grace: Duration::from_secs(5),
            retry: StreamRetryConfig::default(),
        }
    }
}

/// Circuit breaker, retry and timeout settings for direct upstream calls.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls considered for the failure rate.
    pub window_size: usize,
    /// Failure rate over a full window at which the circuit opens.
    pub failure_rate_threshold: f64,
    /// How long an open circuit waits before allowing half-open probes.
    pub open_wait: Duration,
    /// Probe calls allowed through while half-open.
    pub half_open_max_probes: usize,
    pub execute_timeout: Duration,
    pub list_timeout: Duration,
    pub health_timeout: Duration,
    /// Retry attempts for idempotent read-style calls. Tool execution is
    /// never retried.
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_rate_threshold: 0.5,
            open_wait: Duration::from_secs(10),
            half_open_max_probes: 1,
            execute_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

/// Process supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long `start` waits for the child to initialize before reporting
    /// success, also the window in which an immediate exit is detected.
    pub startup_grace: Duration,
    /// How long `stop` waits for a graceful exit before killing.
    pub shutdown_grace: Duration,
    /// Timeout for one synchronous request/response round trip.
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub supervisor: SupervisorConfig,
}
