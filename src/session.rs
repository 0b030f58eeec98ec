//! Per-client session flags.

/// Summary of a [`Session`]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    /// Waiting for `hello`, everything else is ignored
    Idle,
    /// Commands are accepted
    Ready,
    /// Commands are accepted and a target answered the programming enable
    Connected,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Session {
    ready: bool,
    echo: bool,
    target_connected: bool,
}

impl Session {
    pub const fn new() -> Self {
        Self {
            ready: false,
            echo: false,
            target_connected: false,
        }
    }

    pub fn state(&self) -> State {
        match (self.ready, self.target_connected) {
            (false, _) => State::Idle,
            (true, false) => State::Ready,
            (true, true) => State::Connected,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_connected(&self) -> bool {
        self.target_connected
    }

    /// Received characters are echoed only to a greeted client
    pub fn echoes(&self) -> bool {
        self.ready && self.echo
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub(crate) fn greet(&mut self) {
        self.ready = true;
    }

    pub(crate) fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.target_connected = connected;
    }

    /// Drop the client. Returns whether a target was still attached and
    /// needs releasing.
    pub(crate) fn end(&mut self) -> bool {
        let attached = self.target_connected;
        *self = Self::new();
        attached
    }
}
