//! Accounts and authentication.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the built-in administrator account.
pub const ADMIN_USER: &str = "admin";
/// Name of the built-in guest account; its password is `guest`.
pub const GUEST_USER: &str = "guest";
/// Group whose members administer the database.
pub const DBA_GROUP: &str = "dba";

/// A stored account.
#[derive(Clone)]
pub struct Account {
    name: String,
    digest: [u8; 32],
    active: bool,
    groups: Vec<String>,
}

impl Account {
    fn new(name: &str, password: &str, groups: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            digest: digest(name, password),
            active: true,
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
        }
    }

    /// Returns the account name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns false once the account is deactivated.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns the groups the account belongs to.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("active", &self.active)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

/// An authenticated identity, presented when acquiring a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    name: String,
    groups: Vec<String>,
}

impl Subject {
    /// Returns the account name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the groups at authentication time.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Returns true for members of the `dba` group.
    #[must_use]
    pub fn is_dba(&self) -> bool {
        self.groups.iter().any(|g| g == DBA_GROUP)
    }
}

/// Account store of a pool.
///
/// Passwords are kept as SHA-256 digests salted with the account name.
#[derive(Debug)]
pub struct SecurityManager {
    accounts: RwLock<BTreeMap<String, Account>>,
}

impl SecurityManager {
    /// Creates the built-in `admin` and `guest` accounts.
    #[must_use]
    pub fn new(admin_password: &str) -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            ADMIN_USER.to_string(),
            Account::new(ADMIN_USER, admin_password, &[DBA_GROUP]),
        );
        accounts.insert(
            GUEST_USER.to_string(),
            Account::new(GUEST_USER, GUEST_USER, &[GUEST_USER]),
        );
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    /// Checks a password and returns the account's subject.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for an unknown or deactivated account or a
    /// wrong password.
    pub fn authenticate(&self, user: &str, password: &str) -> CoreResult<Subject> {
        let accounts = self.accounts.read();
        let account = accounts
            .get(user)
            .ok_or_else(|| CoreError::authentication(user, "unknown account"))?;
        if !account.active {
            return Err(CoreError::authentication(user, "account is deactivated"));
        }
        if account.digest != digest(user, password) {
            return Err(CoreError::authentication(user, "wrong password"));
        }
        Ok(Subject {
            name: account.name.clone(),
            groups: account.groups.clone(),
        })
    }

    /// Re-checks that a subject's account still exists and is active.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` otherwise.
    pub fn validate(&self, subject: &Subject) -> CoreResult<()> {
        match self.accounts.read().get(&subject.name) {
            Some(account) if account.active => Ok(()),
            Some(_) => Err(CoreError::authentication(&subject.name, "account is deactivated")),
            None => Err(CoreError::authentication(&subject.name, "unknown account")),
        }
    }

    /// Adds an account or replaces its password and groups.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for an empty name.
    pub fn add_account(&self, name: &str, password: &str, groups: &[&str]) -> CoreResult<()> {
        if name.trim().is_empty() {
            return Err(CoreError::invalid_operation("account name must not be empty"));
        }
        self.accounts
            .write()
            .insert(name.to_string(), Account::new(name, password, groups));
        Ok(())
    }

    /// Activates or deactivates an account.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` for an unknown account.
    pub fn set_active(&self, name: &str, active: bool) -> CoreResult<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(name)
            .ok_or_else(|| CoreError::authentication(name, "unknown account"))?;
        account.active = active;
        Ok(())
    }

    /// Returns a copy of an account.
    #[must_use]
    pub fn account(&self, name: &str) -> Option<Account> {
        self.accounts.read().get(name).cloned()
    }

    /// Returns the account names.
    #[must_use]
    pub fn account_names(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }
}

fn digest(user: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_accounts() {
        let security = SecurityManager::new("secret");
        let admin = security.authenticate(ADMIN_USER, "secret").unwrap();
        assert!(admin.is_dba());
        let guest = security.authenticate(GUEST_USER, GUEST_USER).unwrap();
        assert!(!guest.is_dba());
    }

    #[test]
    fn wrong_password_and_unknown_user_fail() {
        let security = SecurityManager::new("secret");
        assert!(matches!(
            security.authenticate(ADMIN_USER, "nope"),
            Err(CoreError::Authentication { .. })
        ));
        assert!(matches!(
            security.authenticate("mallory", ""),
            Err(CoreError::Authentication { .. })
        ));
    }

    #[test]
    fn deactivation_invalidates_existing_subjects() {
        let security = SecurityManager::new("");
        security.add_account("ann", "pw", &["staff"]).unwrap();
        let ann = security.authenticate("ann", "pw").unwrap();
        security.validate(&ann).unwrap();

        security.set_active("ann", false).unwrap();
        assert!(security.validate(&ann).is_err());
        assert!(security.authenticate("ann", "pw").is_err());
    }
}
