use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }
}

/// A random, nonzero id for this process. It distinguishes the process from earlier incarnations
///  at the same address, so zero is reserved for 'no process'.
pub fn new_ct_id<R: Random>() -> u32 {
    loop {
        let id = R::next_u32();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_ct_id_skips_zero() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let mut values = vec![0u32, 0, 42].into_iter();
        let ctx = MockRandom::next_u32_context();
        ctx.expect()
            .times(3)
            .returning(move || values.next().unwrap());

        assert_eq!(new_ct_id::<MockRandom>(), 42);
    }

    #[test]
    fn test_new_ct_id_real() {
        assert_ne!(new_ct_id::<RngRandom>(), 0);
    }
}
