use serde::{Deserialize, Deserializer, Serialize};
use tollgate_clock::{DurationSecs, UnixTime};

use crate::{
    gateway::{AuthGrant, RefreshGrant},
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef,
};

/// The role an account acts under
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A teacher
    Teacher,
    /// A parent
    Parent,
    /// A school
    School,
    /// An administrator
    Admin,
    /// Any role not recognized by this client
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    /// The wire name of the role
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Parent => "parent",
            Role::School => "school",
            Role::Admin => "admin",
            Role::Unknown => "unknown",
        }
    }
}

/// The authenticated user, as reported by the authorization server
///
/// The record is never edited in place; login, signup, refresh and status
/// checks replace it wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The server's identifier for the user
    ///
    /// Numeric identifiers are accepted and kept in their decimal form.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// The user's email address
    pub email: String,
    /// The role the user acts under
    #[serde(default)]
    pub role: Role,
    /// Free-form profile data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(id) => id,
        Id::Number(id) => id.to_string(),
    })
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

/// An authenticated bearer session
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    access_token: AccessToken,
    refresh_token: Option<RefreshToken>,
    expires_at: Option<UnixTime>,
    user: UserRecord,
}

impl Session {
    /// Assembles a session from its parts
    pub fn new(
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        expires_at: Option<UnixTime>,
        user: UserRecord,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            user,
        }
    }

    /// Builds a session from a login or signup grant received at `now`
    pub fn from_grant(grant: AuthGrant, now: UnixTime) -> Self {
        Self {
            expires_at: grant.expires_in.map(|d| now + d),
            access_token: grant.token,
            refresh_token: grant.refresh_token,
            user: grant.user,
        }
    }

    /// Produces the session that results from a successful refresh at `now`
    ///
    /// The access token and expiry are replaced. The refresh token is replaced
    /// only if the server rotated it, and the user record is kept.
    pub fn renewed(&self, grant: RefreshGrant, now: UnixTime) -> Self {
        Self {
            access_token: grant.token,
            refresh_token: grant.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: grant.expires_in.map(|d| now + d),
            user: self.user.clone(),
        }
    }

    /// Returns a copy of this session carrying a different user record
    pub fn with_user(&self, user: UserRecord) -> Self {
        Self {
            user,
            ..self.clone()
        }
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token, if the server issued one
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the time the access token expires, if it expires at all
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Gets the authenticated user
    #[inline]
    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    /// Whether the session can be renewed ahead of expiry
    ///
    /// Requires both a refresh token and a known expiry.
    #[inline]
    pub fn is_proactively_renewable(&self) -> bool {
        self.refresh_token.is_some() && self.expires_at.is_some()
    }

    /// Gets the token's lifecycle status as of the provided time, treating
    /// tokens as stale once `stale_at` has passed
    pub fn token_status_at(&self, time: UnixTime, stale_at: Option<UnixTime>) -> TokenStatus {
        match self.expires_at {
            Some(expiry) if time >= expiry => TokenStatus::Expired,
            _ => match stale_at {
                Some(stale) if time >= stale => TokenStatus::Stale,
                _ => TokenStatus::Fresh,
            },
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    ///
    /// Returns `None` for tokens without a known expiry.
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Option<DurationSecs> {
        self.expires_at.map(|expiry| expiry - time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRecord {
        UserRecord {
            id: "u-1".into(),
            email: "ada@example.com".into(),
            role: Role::Teacher,
            profile: None,
        }
    }

    fn grant(expires_in: Option<u64>) -> AuthGrant {
        AuthGrant {
            token: AccessToken::from_static("access-1"),
            refresh_token: Some(RefreshToken::from_static("refresh-1")),
            expires_in: expires_in.map(DurationSecs),
            user: user(),
        }
    }

    #[test]
    fn grant_expiry_is_relative_to_receipt() {
        let session = Session::from_grant(grant(Some(3600)), UnixTime(1_000));
        assert_eq!(session.expires_at(), Some(UnixTime(4_600)));
        assert!(session.is_proactively_renewable());
    }

    #[test]
    fn grant_without_lifetime_never_expires() {
        let session = Session::from_grant(grant(None), UnixTime(1_000));
        assert_eq!(session.expires_at(), None);
        assert!(!session.is_proactively_renewable());
        assert_eq!(
            session.token_status_at(UnixTime(u64::MAX), None),
            TokenStatus::Fresh
        );
    }

    #[test]
    fn renewal_keeps_refresh_token_unless_rotated() {
        let session = Session::from_grant(grant(Some(60)), UnixTime(0));

        let kept = session.renewed(
            RefreshGrant {
                token: AccessToken::from_static("access-2"),
                refresh_token: None,
                expires_in: Some(DurationSecs(120)),
            },
            UnixTime(50),
        );
        assert_eq!(kept.access_token().as_str(), "access-2");
        assert_eq!(kept.refresh_token().map(|r| r.as_str()), Some("refresh-1"));
        assert_eq!(kept.expires_at(), Some(UnixTime(170)));
        assert_eq!(kept.user(), session.user());

        let rotated = session.renewed(
            RefreshGrant {
                token: AccessToken::from_static("access-3"),
                refresh_token: Some(RefreshToken::from_static("refresh-2")),
                expires_in: None,
            },
            UnixTime(50),
        );
        assert_eq!(rotated.refresh_token().map(|r| r.as_str()), Some("refresh-2"));
        assert_eq!(rotated.expires_at(), None);
    }

    #[test]
    fn token_status_progresses_through_lifetime() {
        let session = Session::from_grant(grant(Some(100)), UnixTime(0));
        let stale = Some(UnixTime(75));
        assert_eq!(session.token_status_at(UnixTime(10), stale), TokenStatus::Fresh);
        assert_eq!(session.token_status_at(UnixTime(80), stale), TokenStatus::Stale);
        assert_eq!(session.token_status_at(UnixTime(100), stale), TokenStatus::Expired);
    }

    #[test]
    fn unrecognized_roles_deserialize_as_unknown() {
        let user: UserRecord =
            serde_json::from_str(r#"{"id":"7","email":"x@example.com","role":"janitor"}"#)
                .unwrap();
        assert_eq!(user.role, Role::Unknown);

        let user: UserRecord =
            serde_json::from_str(r#"{"id":"8","email":"y@example.com"}"#).unwrap();
        assert_eq!(user.role, Role::Unknown);
    }

    #[test]
    fn numeric_user_ids_are_accepted() {
        let user: UserRecord =
            serde_json::from_str(r#"{"id":42,"email":"z@example.com","role":"admin"}"#).unwrap();
        assert_eq!(user.id, "42");
        assert_eq!(user.role, Role::Admin);

        let stored = serde_json::to_string(&user).unwrap();
        assert!(stored.contains(r#""id":"42""#));
        assert_eq!(serde_json::from_str::<UserRecord>(&stored).unwrap(), user);

        assert!(serde_json::from_str::<UserRecord>(r#"{"id":true,"email":"z@example.com"}"#).is_err());
    }
}
