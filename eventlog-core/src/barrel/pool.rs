use parking_lot::Mutex;

/// A barrel that can be returned to a pool.
pub trait Poolable {
    /// Returns the value to a pristine state. Called before every put-back.
    fn reset(&mut self);
}

/// Typed free-list of barrels.
pub struct BarrelPool<B> {
    free: Mutex<Vec<B>>,
    max_idle: usize,
    factory: Box<dyn Fn() -> B + Send + Sync>,
}

impl<B: Poolable> BarrelPool<B> {
    pub fn new(max_idle: usize, factory: impl Fn() -> B + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            factory: Box::new(factory),
        }
    }

    pub fn get(&self) -> B {
        let pooled = self.free.lock().pop();
        pooled.unwrap_or_else(|| (self.factory)())
    }

    pub fn put(&self, mut barrel: B) {
        barrel.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(barrel);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
