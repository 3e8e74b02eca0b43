use std::sync::Arc;

use secrecy::SecretString;

use crate::models::RecordId;
use crate::secrets::SecretVault;
use crate::session::{AuthSession, Principal, SessionContext, SessionProvider};
use crate::store::MemoryStore;

pub(crate) fn principal(user_id: &str) -> Principal {
    Principal {
        id: RecordId::new(user_id),
        email: format!("{user_id}@example.com"),
        company_name: None,
        ape_code: None,
    }
}

pub(crate) fn signed_in_context(user_id: &str) -> SessionContext {
    let context = SessionContext::new();
    context.establish(AuthSession {
        access_token: SecretString::from(format!("access-{user_id}")),
        refresh_token: None,
        expires_at: None,
        principal: principal(user_id),
    });
    context
}

pub(crate) async fn signed_in_provider(memory: Arc<MemoryStore>, user_id: &str) -> SessionProvider {
    let user = principal(user_id);
    memory.register_user(user.clone(), "password");
    let provider = SessionProvider::new(memory, SecretVault::in_memory());
    provider
        .sign_in(&user.email, &SecretString::from("password".to_string()))
        .await
        .unwrap();
    provider
}
