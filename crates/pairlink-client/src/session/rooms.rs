//! Room memberships of a session

use pairlink_core::{PeerId, RoomType};

/// Where outbound signals and relays for a peer are addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub to: PeerId,
    pub room_type: RoomType,
    pub room_id: String,
}

/// Room type to room id, in the order the memberships were added
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rooms {
    entries: Vec<(RoomType, String)>,
}

impl Rooms {
    pub fn new(room_type: RoomType, room_id: impl Into<String>) -> Self {
        Self {
            entries: vec![(room_type, room_id.into())],
        }
    }

    pub fn get(&self, room_type: RoomType) -> Option<&str> {
        self.entries
            .iter()
            .find(|(t, _)| *t == room_type)
            .map(|(_, id)| id.as_str())
    }

    /// Insert or replace the membership for `room_type`, keeping its position
    pub fn set(&mut self, room_type: RoomType, room_id: impl Into<String>) {
        let room_id = room_id.into();
        match self.entries.iter_mut().find(|(t, _)| *t == room_type) {
            Some(entry) => entry.1 = room_id,
            None => self.entries.push((room_type, room_id)),
        }
    }

    pub fn remove(&mut self, room_type: RoomType) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(t, _)| *t != room_type);
        self.entries.len() != before
    }

    pub fn first(&self) -> Option<(RoomType, &str)> {
        self.entries.first().map(|(t, id)| (*t, id.as_str()))
    }

    pub fn contains_id(&self, room_id: &str) -> bool {
        self.entries.iter().any(|(_, id)| id == room_id)
    }

    pub fn types(&self) -> impl Iterator<Item = RoomType> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The pairing secret, if paired
    pub fn secret(&self) -> Option<&str> {
        self.get(RoomType::Secret)
    }

    /// Address for `peer_id` using the first membership
    pub fn route(&self, peer_id: &PeerId) -> Option<Route> {
        self.first().map(|(room_type, room_id)| Route {
            to: peer_id.clone(),
            room_type,
            room_id: room_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_insertion_order() {
        let mut rooms = Rooms::new(RoomType::Ip, "10.0.0.1");
        rooms.set(RoomType::Secret, "s1");
        rooms.set(RoomType::Ip, "10.0.0.2");

        assert_eq!(rooms.first(), Some((RoomType::Ip, "10.0.0.2")));
        assert_eq!(rooms.types().collect::<Vec<_>>(), vec![RoomType::Ip, RoomType::Secret]);
        assert_eq!(rooms.secret(), Some("s1"));
    }

    #[test]
    fn test_remove_moves_route_to_next_room() {
        let mut rooms = Rooms::new(RoomType::Ip, "10.0.0.1");
        rooms.set(RoomType::PublicId, "abcde");
        assert!(rooms.remove(RoomType::Ip));
        assert!(!rooms.remove(RoomType::Ip));

        let route = rooms.route(&PeerId::new("p")).unwrap();
        assert_eq!(route.room_type, RoomType::PublicId);
        assert_eq!(route.room_id, "abcde");
        assert!(rooms.contains_id("abcde"));
    }
}
