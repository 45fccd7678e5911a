//! Per-stream flow control windows

use crate::error::Error;

/// Outbound credit granted by the peer, plus the bytes the stream has
/// accepted but not yet put on the wire.
#[derive(Debug)]
pub(crate) struct SendWindow {
    free_window: u32,
    buffered: u64,
}

impl SendWindow {
    pub fn new(initial: u32) -> SendWindow {
        SendWindow {
            free_window: initial,
            buffered: 0,
        }
    }

    /// Remaining credit in bytes
    pub fn free(&self) -> u32 {
        self.free_window
    }

    /// Writability signal for the caller: more credit than backlog
    pub fn is_writable(&self) -> bool {
        u64::from(self.free_window) > self.buffered
    }

    /// Account bytes accepted from the caller into the write buffer
    pub fn on_buffer(&mut self, n: usize) {
        self.buffered += n as u64;
    }

    /// Account bytes moved from the buffer onto the wire
    pub fn on_wrote(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.buffered);
        debug_assert!(n as u32 <= self.free_window);
        self.buffered -= n as u64;
        self.free_window -= n as u32;
    }

    /// Apply a window update from the peer
    pub fn on_increment(&mut self, delta: u32) -> Result<(), Error> {
        self.free_window = self
            .free_window
            .checked_add(delta)
            .ok_or(Error::FlowControlViolation)?;
        Ok(())
    }
}

/// Inbound credit currently granted to the peer. Replenished in bulk
/// once consumption crosses half the target window, so small reads do
/// not turn into a window update each.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: u32,
    max_window: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> RecvWindow {
        RecvWindow {
            window: initial,
            max_window: initial,
        }
    }

    /// Credit the peer may still spend
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Account an arriving data payload against the granted credit
    pub fn on_data(&mut self, len: u32) -> Result<(), Error> {
        if len > self.window {
            return Err(Error::FlowControlViolation);
        }
        self.window -= len;
        Ok(())
    }

    /// The credit that could be re-advertised right now, given
    /// `buffered` bytes received but not yet consumed by the caller
    fn pending_delta(&self, buffered: usize) -> u32 {
        self.max_window
            .saturating_sub(buffered.min(u32::MAX as usize) as u32)
            .saturating_sub(self.window)
    }

    /// Take the accumulated delta for a window update frame, or None
    /// while it is still below the advertise threshold
    pub fn take_advertise(&mut self, buffered: usize) -> Option<u32> {
        let delta = self.pending_delta(buffered);
        if delta < self.max_window / 2 {
            return None;
        }
        self.window += delta;
        Some(delta)
    }
}

#[cfg(test)]
mod test {
    use super::{RecvWindow, SendWindow};
    use crate::error::Error;

    #[test]
    fn test_send_window_accounting() {
        let mut window = SendWindow::new(10);
        assert!(window.is_writable());

        window.on_buffer(4);
        assert!(window.is_writable());
        window.on_buffer(6);
        // backlog == credit, caller should see backpressure
        assert!(!window.is_writable());

        window.on_wrote(4);
        assert_eq!(window.free(), 6);
        assert!(!window.is_writable());

        window.on_increment(100).unwrap();
        assert_eq!(window.free(), 106);
        assert!(window.is_writable());

        window.on_wrote(6);
        assert_eq!(window.free(), 100);
    }

    #[test]
    fn test_send_window_increment_overflow() {
        let mut window = SendWindow::new(u32::MAX - 10);
        assert_eq!(window.on_increment(20), Err(Error::FlowControlViolation));
        // The window is left untouched by the failed increment
        assert_eq!(window.free(), u32::MAX - 10);
        window.on_increment(10).unwrap();
        assert_eq!(window.free(), u32::MAX);
    }

    #[test]
    fn test_recv_window_data_within_credit() {
        let mut window = RecvWindow::new(256);
        window.on_data(100).unwrap();
        window.on_data(156).unwrap();
        assert_eq!(window.on_data(1), Err(Error::FlowControlViolation));
    }

    #[test]
    fn test_recv_window_advertise_threshold() {
        let mut window = RecvWindow::new(256);
        window.on_data(100).unwrap();
        // 100 consumed bytes are below the half-window threshold
        assert_eq!(window.take_advertise(0), None);

        window.on_data(50).unwrap();
        assert_eq!(window.take_advertise(0), Some(150));
        // Delta already taken, nothing further to advertise
        assert_eq!(window.take_advertise(0), None);
    }

    #[test]
    fn test_recv_window_advertise_excludes_buffered() {
        let mut window = RecvWindow::new(256);
        window.on_data(200).unwrap();
        // 140 of the 200 bytes still sit in the read buffer unconsumed
        assert_eq!(window.take_advertise(140), None);
        // All consumed, full delta released
        assert_eq!(window.take_advertise(0), Some(200));
    }
}
