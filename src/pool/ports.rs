use std::collections::BTreeSet;

/// Hands out host ports for one pool.
///
/// Fresh ports come from a strictly increasing cursor starting at
/// `host_port_start`. A port is reused only after [`PortAllocator::free`],
/// which the pool calls once the container holding it has been removed.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    /// Offset of the next fresh port from `start`.
    cursor: u32,
    free: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            start,
            cursor: 0,
            free: BTreeSet::new(),
        }
    }

    /// Next port: the lowest freed port, else the next fresh one. `None` once
    /// the u16 range is exhausted.
    pub fn next(&mut self) -> Option<u16> {
        if let Some(port) = self.free.pop_first() {
            return Some(port);
        }
        let port = u32::from(self.start) + self.cursor;
        if port > u32::from(u16::MAX) {
            return None;
        }
        self.cursor += 1;
        Some(port as u16)
    }

    /// Return a port whose container is gone.
    pub fn free(&mut self, port: u16) {
        let issued = u32::from(port) >= u32::from(self.start) &&
            u32::from(port) < u32::from(self.start) + self.cursor;
        if issued {
            self.free.insert(port);
        }
    }
}
