use crate::{
    backend::Backend,
    engine::{self, LobbyHandle},
    lobby::{Lobby, LobbyError, Profile, UserId},
    runner::Runner,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// External collaborators shared by every lobby.
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn Backend>,
    pub runner: Arc<dyn Runner>,
}

#[derive(Default)]
struct Registry {
    lobbies: HashMap<Uuid, LobbyHandle>,
    memberships: HashMap<UserId, Uuid>,
}

/// Process-wide table of active lobbies. Guards only the table itself;
/// each lobby's contents belong to its engine task.
#[derive(Clone, Default)]
pub struct LobbyRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl LobbyRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a lobby owned by `owner` and starts its engine.
    pub fn create(&self, owner: Profile, services: Services) -> Result<LobbyHandle, LobbyError> {
        let mut registry = self.write();
        if registry.memberships.contains_key(&owner.id) {
            return Err(LobbyError::InAnotherLobby);
        }
        let id = Uuid::new_v4();
        let owner_id = owner.id;
        let handle = engine::spawn(Lobby::new(id, owner), services, self.clone());
        registry.lobbies.insert(id, handle.clone());
        registry.memberships.insert(owner_id, id);
        Ok(handle)
    }

    pub fn get(&self, id: &Uuid) -> Option<LobbyHandle> {
        self.read().lobbies.get(id).cloned()
    }

    pub fn handles(&self) -> Vec<LobbyHandle> {
        self.read().lobbies.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the lobby and releases all of its memberships.
    pub fn remove(&self, id: &Uuid) -> Option<LobbyHandle> {
        let mut registry = self.write();
        registry.memberships.retain(|_, lobby| lobby != id);
        registry.lobbies.remove(id)
    }

    pub fn lobby_of(&self, user: UserId) -> Option<Uuid> {
        self.read().memberships.get(&user).copied()
    }

    /// Records `user` as belonging to `lobby` unless they belong elsewhere.
    pub fn claim(&self, user: UserId, lobby: Uuid) -> Result<(), LobbyError> {
        let mut registry = self.write();
        match registry.memberships.get(&user) {
            Some(current) if *current != lobby => Err(LobbyError::InAnotherLobby),
            _ => {
                registry.memberships.insert(user, lobby);
                Ok(())
            }
        }
    }

    pub fn release(&self, user: UserId, lobby: Uuid) {
        let mut registry = self.write();
        if registry.memberships.get(&user) == Some(&lobby) {
            registry.memberships.remove(&user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_per_user() {
        let registry = LobbyRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.claim(1, a).unwrap();
        assert_eq!(registry.claim(1, a), Ok(()));
        assert_eq!(registry.claim(1, b), Err(LobbyError::InAnotherLobby));
        registry.release(1, b);
        assert_eq!(registry.lobby_of(1), Some(a));
        registry.release(1, a);
        assert_eq!(registry.claim(1, b), Ok(()));
    }

    #[test]
    fn removing_a_lobby_releases_its_members() {
        let registry = LobbyRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.claim(1, a).unwrap();
        registry.claim(2, a).unwrap();
        registry.claim(3, b).unwrap();
        assert!(registry.remove(&a).is_none());
        assert_eq!(registry.lobby_of(1), None);
        assert_eq!(registry.lobby_of(2), None);
        assert_eq!(registry.lobby_of(3), Some(b));
    }
}
