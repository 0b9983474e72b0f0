use crate::barrel::{Barrel, BarrelPool};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// `event_id -> barrel` map with a pooled allocator.
///
/// Lookups take the read lock; creation and removal take the write lock with
/// a second lookup after upgrading.
pub struct BarrelTable<B: Barrel> {
    barrels: RwLock<HashMap<String, Arc<B>>>,
    pool: BarrelPool<B>,
}

impl<B: Barrel> BarrelTable<B> {
    pub fn new(pool: BarrelPool<B>) -> Self {
        Self {
            barrels: RwLock::new(HashMap::new()),
            pool,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<B>> {
        self.barrels.read().get(id).cloned()
    }

    pub fn get_or_create(&self, id: &str, seed: impl FnOnce(&mut B)) -> Arc<B> {
        if let Some(barrel) = self.get(id) {
            return barrel;
        }

        let mut barrels = self.barrels.write();
        if let Some(barrel) = barrels.get(id) {
            return barrel.clone();
        }

        let mut barrel = self.pool.get();
        seed(&mut barrel);
        let barrel = Arc::new(barrel);
        barrels.insert(id.to_string(), barrel.clone());
        barrel
    }

    pub fn snapshot(&self) -> Vec<Arc<B>> {
        self.barrels.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.barrels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.barrels.read().is_empty()
    }

    /// Barrels idle for longer than `idle` (optionally only those without
    /// subscribers). Taken from a read-locked snapshot.
    pub fn idle_candidates(
        &self,
        now: DateTime<Utc>,
        idle: Duration,
        require_no_subscribers: bool,
    ) -> Vec<Arc<B>> {
        self.snapshot()
            .into_iter()
            .filter(|barrel| is_idle(barrel.as_ref(), now, idle, require_no_subscribers))
            .collect()
    }

    /// Second GC pass: removes the marked ids under the write lock, re-checking
    /// idleness so a barrel that received traffic in between survives.
    pub fn remove_idle(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
        idle: Duration,
        require_no_subscribers: bool,
    ) -> Vec<Arc<B>> {
        let mut barrels = self.barrels.write();
        let mut removed = Vec::new();
        for id in ids {
            let still_idle = barrels
                .get(id)
                .is_some_and(|barrel| is_idle(barrel.as_ref(), now, idle, require_no_subscribers));
            if still_idle {
                if let Some(barrel) = barrels.remove(id) {
                    removed.push(barrel);
                }
            }
        }
        removed
    }

    pub fn drain(&self) -> Vec<Arc<B>> {
        self.barrels.write().drain().map(|(_, barrel)| barrel).collect()
    }

    /// Closes the barrel's subscribers and returns it to the pool when no
    /// other task still holds it.
    pub fn recycle(&self, barrel: Arc<B>) {
        barrel.close_subscribers();
        if let Ok(barrel) = Arc::try_unwrap(barrel) {
            self.pool.put(barrel);
        }
    }

    pub fn pooled(&self) -> usize {
        self.pool.idle()
    }
}

fn is_idle<B: Barrel>(
    barrel: &B,
    now: DateTime<Utc>,
    idle: Duration,
    require_no_subscribers: bool,
) -> bool {
    crate::clock::is_older_than(now, barrel.update_time(), idle)
        && (!require_no_subscribers || barrel.subscriber_count() == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrel::ReadBarrel;

    fn table() -> BarrelTable<ReadBarrel> {
        BarrelTable::new(BarrelPool::new(4, || ReadBarrel::new(4, 4)))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = table();
        let now = Utc::now();
        let a = table.get_or_create("a", |b| b.seed("a", now));
        let again = table.get_or_create("a", |_| panic!("seeded twice"));
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_idle_removal_respects_subscribers() {
        let table = table();
        let start = Utc::now();
        table.get_or_create("a", |b| b.seed("a", start));
        let watched = table.get_or_create("b", |b| b.seed("b", start));
        let _sub = watched.subscribe("s1");
        drop(watched);

        let later = start + Duration::seconds(121);
        let candidates: Vec<String> = table
            .idle_candidates(later, Duration::minutes(2), true)
            .iter()
            .map(|b| b.id().to_string())
            .collect();
        assert_eq!(candidates, vec!["a".to_string()]);

        let removed = table.remove_idle(&candidates, later, Duration::minutes(2), true);
        assert_eq!(removed.len(), 1);
        for barrel in removed {
            table.recycle(barrel);
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.pooled(), 1);
    }
}
