//! Typed record API
//!
//! Every write goes through [`nexus_core::Records`], which commits to the store and emits
//! the change event the reconciler acts on.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use nexus_api::requests::{GroupRequest, MachineRequest, SettingsRequest, UserRequest};
use nexus_api::responses::MachineResponse;
use nexus_ca::net;
use nexus_core::{Group, Machine, Settings, User};

use crate::api::client::machine_response;
use crate::api::error::AppError;
use crate::state::AppState;

const MAX_LOGIN_LEN: usize = 32;

/// Whether `name` is usable as a Linux login and as a file name under the principals directory
pub(crate) fn is_valid_login(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LOGIN_LEN
        && !name.starts_with(['-', '.'])
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
}

/// # Errors
/// Returns 400 for an empty host
pub async fn put_machine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MachineRequest>,
) -> Result<Json<MachineResponse>, AppError> {
    if req.host.trim().is_empty() {
        return Err(AppError::bad_request("host must not be empty"));
    }
    let machine = Machine::new(id, req.name, req.host.trim())
        .with_port(req.port)
        .with_users(req.users)
        .with_groups(req.groups);
    let saved = state.records.put_machine(machine).await?;
    Ok(Json(machine_response(saved)))
}

/// Delete a machine; its trust material is torn down by the reconciler
///
/// # Errors
/// Returns 404 for an unknown machine
pub async fn delete_machine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MachineResponse>, AppError> {
    let removed = state.records.delete_machine(&id).await?;
    Ok(Json(machine_response(removed)))
}

/// # Errors
/// Returns error if the store rejects the write
pub async fn put_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UserRequest>,
) -> Result<Json<User>, AppError> {
    let user = User::new(id, req.name).with_groups(req.groups);
    Ok(Json(state.records.put_user(user).await?))
}

/// # Errors
/// Returns 404 for an unknown user
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<User>, AppError> {
    Ok(Json(state.records.delete_user(&id).await?))
}

/// # Errors
/// Returns 400 if the Linux username is not a valid login
pub async fn put_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<GroupRequest>,
) -> Result<Json<Group>, AppError> {
    if !is_valid_login(&req.linux_username) {
        return Err(AppError::bad_request(format!(
            "invalid linux username: {}",
            req.linux_username
        )));
    }
    let group = Group::new(id, req.name, req.linux_username);
    Ok(Json(state.records.put_group(group).await?))
}

/// # Errors
/// Returns 404 for an unknown group
pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Group>, AppError> {
    Ok(Json(state.records.delete_group(&id).await?))
}

/// Apply the fields present in `req`; an empty `external_url` clears it
///
/// # Errors
/// Returns 400 for a zero lease or an endpoint that is neither an IP nor a domain
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettingsRequest>,
) -> Result<Json<Settings>, AppError> {
    validate_settings(&req)?;
    let settings = state
        .records
        .update_settings(move |s| apply_settings(s, req))
        .await?;
    Ok(Json(settings))
}

fn validate_settings(req: &SettingsRequest) -> Result<(), AppError> {
    for (field, value) in [
        ("user_lease", req.user_lease),
        ("host_lease", req.host_lease),
        ("max_lease", req.max_lease),
    ] {
        if value == Some(0) {
            return Err(AppError::bad_request(format!("{field} must be positive")));
        }
    }
    if let Some(url) = req.external_url.as_deref().filter(|u| !u.trim().is_empty()) {
        let host = net::host_of(url);
        if !net::is_ip(&host) && !net::is_valid_domain(&host) {
            return Err(AppError::bad_request(format!("invalid external url: {url}")));
        }
    }
    Ok(())
}

fn apply_settings(settings: &mut Settings, req: SettingsRequest) {
    if let Some(ssh_config) = req.ssh_config {
        settings.ssh_config = ssh_config;
    }
    if let Some(lease) = req.user_lease {
        settings.user_lease = lease;
    }
    if let Some(lease) = req.host_lease {
        settings.host_lease = lease;
    }
    if let Some(lease) = req.max_lease {
        settings.max_lease = lease;
    }
    if let Some(install) = req.install_agent {
        settings.install_agent = install;
    }
    if let Some(url) = req.external_url {
        let url = url.trim().to_string();
        settings.external_url = (!url.is_empty()).then_some(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_validation() {
        assert!(is_valid_login("deploy"));
        assert!(is_valid_login("svc_backup-2"));
        assert!(!is_valid_login(""));
        assert!(!is_valid_login("../etc"));
        assert!(!is_valid_login("Admin"));
        assert!(!is_valid_login("-rf"));
        assert!(!is_valid_login("a/b"));
    }

    #[test]
    fn test_partial_settings_update() {
        let mut settings = Settings::default();
        apply_settings(
            &mut settings,
            SettingsRequest {
                user_lease: Some(600),
                external_url: Some("https://nexus.example.com".to_string()),
                ..SettingsRequest::default()
            },
        );
        assert_eq!(settings.user_lease, 600);
        assert_eq!(settings.host_lease, Settings::default().host_lease);
        assert_eq!(settings.external_url.as_deref(), Some("https://nexus.example.com"));

        apply_settings(
            &mut settings,
            SettingsRequest {
                external_url: Some(" ".to_string()),
                ..SettingsRequest::default()
            },
        );
        assert_eq!(settings.external_url, None);
    }

    #[test]
    fn test_settings_validation() {
        let zero = SettingsRequest {
            max_lease: Some(0),
            ..SettingsRequest::default()
        };
        assert!(validate_settings(&zero).is_err());

        let bad_url = SettingsRequest {
            external_url: Some("https://not_a domain".to_string()),
            ..SettingsRequest::default()
        };
        assert!(validate_settings(&bad_url).is_err());

        let ip = SettingsRequest {
            external_url: Some("10.0.0.1:8091".to_string()),
            ..SettingsRequest::default()
        };
        assert!(validate_settings(&ip).is_ok());
    }
}
