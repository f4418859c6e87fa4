use std::sync::Arc;

use crate::transport::ChatTransport;

/// Channel-membership gate. Fails closed: anything other than a confirmed
/// member/administrator/creator status denies access.
pub struct Gatekeeper {
    transport: Arc<dyn ChatTransport>,
    channel_id: String,
}

impl Gatekeeper {
    pub fn new(transport: Arc<dyn ChatTransport>, channel_id: impl Into<String>) -> Self {
        Self {
            transport,
            channel_id: channel_id.into(),
        }
    }

    pub async fn is_member(&self, user_id: i64) -> bool {
        match self
            .transport
            .membership_status(&self.channel_id, user_id)
            .await
        {
            Ok(status) => {
                let allowed = status.grants_access();
                if !allowed {
                    tracing::debug!(
                        "User {} is not a member of {} ({:?})",
                        user_id,
                        self.channel_id,
                        status
                    );
                }
                allowed
            }
            Err(e) => {
                tracing::warn!(
                    "Membership check for user {} in {} failed, denying: {:#}",
                    user_id,
                    self.channel_id,
                    e
                );
                false
            }
        }
    }
}
