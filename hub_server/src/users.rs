use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::UserDbError;

/// The external user/password backend consulted for registration and login.
pub trait UserDatabase: Send + Sync
{
    fn is_registered(&self, name: &str) -> Result<bool, UserDbError>;
    fn get_user_password(&self, name: &str) -> Result<String, UserDbError>;
    fn register_user(&self, name: &str, pass: &str) -> Result<(), UserDbError>;
}

/// An in-memory users database, the default backend.
#[derive(Default)]
pub struct MemUserDatabase
{
    users: RwLock<HashMap<String, String>>,
}

impl MemUserDatabase
{
    pub fn new() -> Self
    {
        Self::default()
    }
}

impl UserDatabase for MemUserDatabase
{
    fn is_registered(&self, name: &str) -> Result<bool, UserDbError>
    {
        Ok(self.users.read().contains_key(name))
    }

    fn get_user_password(&self, name: &str) -> Result<String, UserDbError>
    {
        Ok(self.users.read().get(name).cloned().unwrap_or_default())
    }

    fn register_user(&self, name: &str, pass: &str) -> Result<(), UserDbError>
    {
        self.users.write().insert(name.to_string(), pass.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn registers_and_looks_up_users()
    {
        let db = MemUserDatabase::new();
        assert_eq!(db.is_registered("alice"), Ok(false));

        db.register_user("alice", "secret").unwrap();
        assert_eq!(db.is_registered("alice"), Ok(true));
        assert_eq!(db.get_user_password("alice").unwrap(), "secret");
        assert_eq!(db.get_user_password("bob").unwrap(), "");
    }
}
