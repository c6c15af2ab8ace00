use async_trait::async_trait;

/// Admission check run once per provisioning request.
#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    async fn under_quota(&self, owner_id: &str) -> bool;
}

/// Admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaPolicy for UnlimitedQuota {
    async fn under_quota(&self, _owner_id: &str) -> bool {
        true
    }
}
