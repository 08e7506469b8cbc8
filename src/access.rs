//! Management privilege check
//!
//! Creating a topic requires management rights on the target endpoint. The
//! decision belongs to the host's naming/authorization service; the
//! registry only asks.

use crate::types::EndpointKey;

/// Authorization collaborator consulted on topic creation
pub trait AccessPolicy: Send + Sync {
    fn can_manage(&self, endpoint: &EndpointKey) -> bool;
}

/// Grants every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_manage(&self, _endpoint: &EndpointKey) -> bool {
        true
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&EndpointKey) -> bool + Send + Sync,
{
    fn can_manage(&self, endpoint: &EndpointKey) -> bool {
        self(endpoint)
    }
}
