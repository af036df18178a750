//! The authentication seam.
//!
//! The runtime never manages credentials; it asks the embedding
//! application's [`AuthAdapter`] for the current device id and account
//! whenever a dispatcher stamps authorship onto a new event. A `None`
//! account means the device is logged out: events are still applied and
//! persisted locally, just not recorded on the server until an account
//! appears (deferred authorship).

use std::sync::Arc;

use async_trait::async_trait;

/// The account identity the runtime needs: an id, nothing more.
///
/// Applications implement this on their own user type; dispatch policies
/// receive it as `&dyn Account` and may downcast-free inspect only the id.
pub trait Account: Send + Sync {
    /// Stable account identifier, stamped into `created_by`.
    fn id(&self) -> &str;
}

/// Provider of the local device identity and the currently signed-in
/// account.
#[async_trait]
pub trait AuthAdapter: Send + Sync {
    /// The stable id of this device, stamped into `created_on`.
    async fn device_id(&self) -> String;

    /// The currently signed-in account, or `None` while logged out.
    async fn account(&self) -> Option<Arc<dyn Account>>;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use std::sync::Mutex;

    /// Minimal account fixture.
    pub(crate) struct TestAccount(pub String);

    impl Account for TestAccount {
        fn id(&self) -> &str {
            &self.0
        }
    }

    /// Auth adapter with a fixed device id and a switchable account,
    /// used to exercise logged-out dispatch and deferred authorship.
    pub(crate) struct StaticAuth {
        device: String,
        account: Mutex<Option<Arc<dyn Account>>>,
    }

    impl StaticAuth {
        pub(crate) fn new(device: &str) -> Arc<Self> {
            Arc::new(Self {
                device: device.to_string(),
                account: Mutex::new(None),
            })
        }

        pub(crate) fn logged_in(device: &str, account_id: &str) -> Arc<Self> {
            let auth = Self::new(device);
            auth.set_account(Some(account_id));
            auth
        }

        pub(crate) fn set_account(&self, account_id: Option<&str>) {
            *self.account.lock().expect("account lock") = account_id
                .map(|id| Arc::new(TestAccount(id.to_string())) as Arc<dyn Account>);
        }
    }

    #[async_trait]
    impl AuthAdapter for StaticAuth {
        async fn device_id(&self) -> String {
            self.device.clone()
        }

        async fn account(&self) -> Option<Arc<dyn Account>> {
            self.account.lock().expect("account lock").clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::StaticAuth;
    use super::*;

    #[tokio::test]
    async fn logged_out_by_default() {
        let auth = StaticAuth::new("device-1");
        assert_eq!(auth.device_id().await, "device-1");
        assert!(auth.account().await.is_none());
    }

    #[tokio::test]
    async fn login_switches_account() {
        let auth = StaticAuth::new("device-1");
        auth.set_account(Some("acct-9"));
        let account = auth.account().await.expect("account should be present");
        assert_eq!(account.id(), "acct-9");

        auth.set_account(None);
        assert!(auth.account().await.is_none());
    }
}
