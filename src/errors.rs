// OpenDirectory, the pluggable directory management backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2023  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

use ldap3::LdapError;
use rocket::http::Status;
use thiserror::Error;

use crate::openapi::ApiError;

/// Shorthand for results produced inside the directory engine.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Every failure the directory engine can produce.
///
/// Each variant corresponds to one stable error kind which is exposed to API
/// clients through [`DirectoryError::kind`] and mapped to an HTTP status
/// through [`DirectoryError::status`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("failed to bind to the directory server: {0}")]
    BindFailed(String),
    #[error("directory i/o failed: {0}")]
    Io(String),
    #[error("no entry found at '{dn}'")]
    NotFound { dn: String },
    #[error("the directory server rejected the operation: {message}")]
    Constraint { message: String },
    #[error("attribute '{attribute}' is not part of the schema")]
    UnknownAttribute { attribute: String },
    #[error("required attribute '{attribute}' is missing")]
    RequiredMissing { attribute: String },
    #[error("value '{value}' of attribute '{attribute}' is not acceptable")]
    TestFailed { attribute: String, value: String },
    #[error("fixed attribute '{attribute}' differs from its schema default")]
    FixedMismatch { attribute: String },
    #[error("fixed attribute '{attribute}' cannot be modified")]
    FixedImmutable { attribute: String },
    #[error("pointer attribute '{attribute}' references the missing entry '{target}'")]
    PointerDangling { attribute: String, target: String },
    #[error("pointer attribute '{attribute}' references '{target}' outside of its declared branches")]
    PointerOutOfBranch { attribute: String, target: String },
    #[error("organization '{dn}' still has entries linked to it")]
    OrgNotEmpty { dn: String },
    #[error("the organization link of '{dn}' cannot be removed")]
    OrgLinkImmutable { dn: String },
    #[error("the organization path of '{dn}' cannot be removed")]
    OrgPathImmutable { dn: String },
    #[error("no permission on '{base}'")]
    PermissionDenied { base: String },
    #[error("hook '{hook}' rejected the operation: {message}")]
    HookRejected { hook: String, message: String },
    #[error("failed to move '{dn}' to the trash: {message}")]
    TrashMoveFailed { dn: String, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DirectoryError {
    /// The stable identifier of this error kind.
    pub fn kind(&self) -> &'static str {
        use DirectoryError::*;
        match self {
            ConfigInvalid(_) => "CONFIG_INVALID",
            BindFailed(_) => "LDAP_BIND_FAILED",
            Io(_) => "LDAP_IO_FAILED",
            NotFound { .. } => "LDAP_NOT_FOUND",
            Constraint { .. } => "LDAP_CONSTRAINT",
            UnknownAttribute { .. } => "SCHEMA_UNKNOWN_ATTR",
            RequiredMissing { .. } => "SCHEMA_REQUIRED_MISSING",
            TestFailed { .. } => "SCHEMA_TEST_FAILED",
            FixedMismatch { .. } => "FIXED_MISMATCH",
            FixedImmutable { .. } => "FIXED_IMMUTABLE",
            PointerDangling { .. } => "POINTER_DANGLING",
            PointerOutOfBranch { .. } => "POINTER_OUT_OF_BRANCH",
            OrgNotEmpty { .. } => "ORG_NOT_EMPTY",
            OrgLinkImmutable { .. } => "ORG_LINK_IMMUTABLE",
            OrgPathImmutable { .. } => "ORG_PATH_IMMUTABLE",
            PermissionDenied { .. } => "PERMISSION_DENIED",
            HookRejected { .. } => "HOOK_REJECTED",
            TrashMoveFailed { .. } => "TRASH_MOVE_FAILED",
            Internal(_) => "INTERNAL",
        }
    }

    /// The HTTP status this error kind maps to.
    pub fn status(&self) -> Status {
        use DirectoryError::*;
        match self {
            UnknownAttribute { .. }
            | RequiredMissing { .. }
            | TestFailed { .. }
            | FixedMismatch { .. }
            | FixedImmutable { .. }
            | PointerDangling { .. }
            | PointerOutOfBranch { .. }
            | OrgLinkImmutable { .. }
            | OrgPathImmutable { .. } => Status::BadRequest,
            PermissionDenied { .. } => Status::Forbidden,
            NotFound { .. } => Status::NotFound,
            Constraint { .. } | OrgNotEmpty { .. } => Status::Conflict,
            _ => Status::InternalServerError,
        }
    }
}

impl From<LdapError> for DirectoryError {
    fn from(err: LdapError) -> Self {
        match err {
            LdapError::LdapResult { result } => match result.rc {
                // noSuchObject
                32 => DirectoryError::NotFound {
                    dn: result.matched,
                },
                // constraintViolation, attributeOrValueExists, objectClassViolation,
                // notAllowedOnNonLeaf and entryAlreadyExists
                19 | 20 | 65 | 66 | 68 => DirectoryError::Constraint {
                    message: format!("{} (rc={})", result.text, result.rc),
                },
                // invalidCredentials
                49 => DirectoryError::BindFailed(result.text),
                // insufficientAccessRights
                50 => DirectoryError::PermissionDenied {
                    base: result.matched,
                },
                _ => DirectoryError::Io(format!("{} (rc={})", result.text, result.rc)),
            },
            other => DirectoryError::Io(other.to_string()),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        let status = err.status();
        let msg = if status == Status::InternalServerError {
            // the structured cause is only logged
            error!("internal error ({}): {}", err.kind(), err);
            Some("Something went wrong on the server, check the logs.".to_string())
        } else {
            Some(err.to_string())
        };
        ApiError {
            err: err.kind().to_string(),
            msg,
            http_status_code: status.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3::result::LdapResult;

    fn ldap_result(rc: u32) -> LdapError {
        LdapError::LdapResult {
            result: LdapResult {
                rc,
                matched: "ou=x,dc=ex".to_string(),
                text: "oops".to_string(),
                refs: vec![],
                ctrls: vec![],
            },
        }
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = DirectoryError::from(ldap_result(32));
        assert_eq!(err.kind(), "LDAP_NOT_FOUND");
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn already_exists_maps_to_conflict() {
        let err = DirectoryError::from(ldap_result(68));
        assert_eq!(err.kind(), "LDAP_CONSTRAINT");
        assert_eq!(err.status(), Status::Conflict);
    }

    #[test]
    fn schema_kinds_are_client_errors() {
        let err = DirectoryError::FixedImmutable {
            attribute: "objectClass".to_string(),
        };
        assert_eq!(err.kind(), "FIXED_IMMUTABLE");
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[test]
    fn permission_denied_is_forbidden() {
        let err = DirectoryError::PermissionDenied {
            base: "ou=b,dc=ex".to_string(),
        };
        assert_eq!(err.status(), Status::Forbidden);
    }
}
