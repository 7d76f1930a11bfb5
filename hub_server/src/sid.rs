use dc_proto::Sid;
use parking_lot::Mutex;

use crate::errors::RegistryError;

/// Hands out session identifiers, unique among all live and reserved peers.
///
/// Identifiers released after a session ends are recycled before the counter
/// advances. The hub's own SID (zero) is never handed out.
#[derive(Default)]
pub struct SidAllocator
{
    inner: Mutex<AllocatorState>,
}

struct AllocatorState
{
    next: u32,
    free: Vec<Sid>,
}

impl Default for AllocatorState
{
    fn default() -> Self
    {
        Self { next: 1, free: Vec::new() }
    }
}

impl SidAllocator
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn next(&self) -> Result<Sid, RegistryError>
    {
        let mut state = self.inner.lock();
        if let Some(sid) = state.free.pop() {
            return Ok(sid);
        }
        if state.next > Sid::MAX_VALUE {
            return Err(RegistryError::SidExhausted);
        }
        let sid = Sid::new(state.next);
        state.next += 1;
        Ok(sid)
    }

    pub fn release(&self, sid: Sid)
    {
        self.inner.lock().free.push(sid);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn allocates_distinct_sids()
    {
        let alloc = SidAllocator::new();
        let a = alloc.next().unwrap();
        let b = alloc.next().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, Sid::HUB);
        assert_ne!(b, Sid::HUB);
    }

    #[test]
    fn recycles_released_sids()
    {
        let alloc = SidAllocator::new();
        let a = alloc.next().unwrap();
        let _b = alloc.next().unwrap();
        alloc.release(a);
        assert_eq!(alloc.next().unwrap(), a);
    }

    #[test]
    fn reports_exhaustion()
    {
        let alloc = SidAllocator::new();
        alloc.inner.lock().next = Sid::MAX_VALUE;
        assert!(alloc.next().is_ok());
        assert_eq!(alloc.next(), Err(RegistryError::SidExhausted));

        alloc.release(Sid::new(7));
        assert_eq!(alloc.next(), Ok(Sid::new(7)));
    }
}
