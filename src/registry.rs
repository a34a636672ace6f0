use crate::streaming::StreamingSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// TranscribeID → 稼働中のストリーミングセッション
///
/// キーが存在しないことと、セッションが1つもないことは同値。
/// ロック中はマップの操作だけを行い、I/Oは行わない。
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Vec<StreamingSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<StreamingSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// セッションを登録（既存のエントリには追加する）
    pub fn insert(&self, transcribe_id: Uuid, sessions: Vec<StreamingSession>) {
        if sessions.is_empty() {
            return;
        }
        self.lock().entry(transcribe_id).or_default().extend(sessions);
    }

    /// エントリを取り除いて返す
    pub fn remove(&self, transcribe_id: Uuid) -> Option<Vec<StreamingSession>> {
        self.lock().remove(&transcribe_id)
    }

    /// 終了したセッションを1つ取り除く
    ///
    /// 最後のセッションが取り除かれたらキーも消す。
    pub fn remove_session(&self, transcribe_id: Uuid, streaming_id: Uuid) -> Option<StreamingSession> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&transcribe_id)?;
        let index = entry.iter().position(|s| s.id() == streaming_id)?;
        let removed = entry.remove(index);
        if entry.is_empty() {
            sessions.remove(&transcribe_id);
        }
        Some(removed)
    }

    /// 登録されているセッション数
    pub fn session_count(&self, transcribe_id: Uuid) -> usize {
        self.lock().get(&transcribe_id).map_or(0, Vec::len)
    }

    /// 登録されているストリーミングID
    pub fn streaming_ids(&self, transcribe_id: Uuid) -> Vec<Uuid> {
        self.lock()
            .get(&transcribe_id)
            .map(|sessions| sessions.iter().map(StreamingSession::id).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, transcribe_id: Uuid) -> bool {
        self.lock().contains_key(&transcribe_id)
    }

    /// 登録されているTranscribe数
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Streaming};

    fn session(transcribe_id: Uuid, direction: Direction) -> StreamingSession {
        let streaming = Streaming {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            transcribe_id,
            language: "en-US".to_string(),
            direction,
        };
        StreamingSession::detached(streaming)
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();

        registry.insert(id, vec![session(id, Direction::In), session(id, Direction::Out)]);
        assert_eq!(registry.session_count(id), 2);
        assert_eq!(registry.streaming_ids(id).len(), 2);
        assert!(registry.contains(id));

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!registry.contains(id));
        assert_eq!(registry.session_count(id), 0);
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_remove_session_drops_key_with_last_session() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let inbound = session(id, Direction::In);
        let outbound = session(id, Direction::Out);
        let (in_id, out_id) = (inbound.id(), outbound.id());
        registry.insert(id, vec![inbound, outbound]);

        assert!(registry.remove_session(id, Uuid::new_v4()).is_none());
        assert_eq!(registry.remove_session(id, in_id).map(|s| s.id()), Some(in_id));
        assert_eq!(registry.streaming_ids(id), vec![out_id]);
        assert!(registry.contains(id));

        assert!(registry.remove_session(id, out_id).is_some());
        assert!(!registry.contains(id));
        assert!(registry.remove_session(id, out_id).is_none());
    }

    #[test]
    fn test_empty_insert_creates_no_entry() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();

        registry.insert(id, Vec::new());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = SessionRegistry::new();
        let b = SessionRegistry::new();
        let id = Uuid::new_v4();

        a.insert(id, vec![session(id, Direction::In)]);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);

        // クローンは同じマップを共有する
        let a2 = a.clone();
        a2.remove(id);
        assert!(a.is_empty());
    }
}
