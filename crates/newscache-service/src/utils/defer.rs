/// Guard that runs a closure when dropped.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
///
/// The cache directory uses this to give up a slot reference on every exit path of
/// an obtain attempt, including `?` returns and unwinding consumers, and to drop a
/// generation from its running set once it published.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(0);
        {
            let _guard = defer(|| ran.set(ran.get() + 1));
            assert_eq!(ran.get(), 0);
        }
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_runs_on_unwind() {
        let ran = Cell::new(false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = defer(|| ran.set(true));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(ran.get());
    }
}
