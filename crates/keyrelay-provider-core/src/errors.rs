use keyrelay_common::{ModelFamily, Service};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyPoolError {
    #[error("no {service} keys available for {family}")]
    NoKeysAvailable {
        service: Service,
        family: ModelFamily,
        /// Some key would qualify if it were not out of credit.
        over_quota: bool,
    },
    #[error("no configured service serves model {0}")]
    UnknownModel(String),
    #[error("service {0} has no keys configured")]
    ServiceNotConfigured(Service),
    #[error("invalid {service} key: {reason}")]
    InvalidSecret {
        service: Service,
        reason: &'static str,
    },
}

/// Why a liveness check rejected a key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckFailure {
    #[error("key revoked: {0}")]
    Revoked(String),
    #[error("key out of quota: {0}")]
    Quota(String),
    #[error("key rate limited during check")]
    RateLimited,
    #[error("check failed: {0}")]
    Transient(String),
}
