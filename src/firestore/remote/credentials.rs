use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::User;
use crate::firestore::error::FirestoreResult;

/// A bearer token and the user it authenticates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Token {
    pub fn new(value: impl Into<String>, user: User) -> Self {
        Self {
            value: value.into(),
            user,
        }
    }
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync + 'static>;

/// Yields bearer tokens for the streams and reports user switches.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// `None` for unauthenticated access.
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);

    /// Installs the callback invoked with the current user right away and
    /// again whenever the signed-in user changes.
    fn set_change_listener(&self, listener: UserChangeListener);

    fn remove_change_listener(&self) {}
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

/// Unauthenticated access.
#[derive(Clone, Debug, Default)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        listener(User::unauthenticated());
    }
}
