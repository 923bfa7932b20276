use bitflags::bitflags;

bitflags! {
    /// Capabilities requested from, and advertised by, a provider.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const ATOMIC = 1 << 4;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
        /// Report the source address of received messages.
        const SOURCE = 1 << 57;
        /// Report unknown sources through `AddrNotAvail` error entries.
        const SOURCE_ERR = 1 << 59;
    }
}

bitflags! {
    /// Flags attached to a completion entry describing what completed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CompletionFlags: u64 {
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const TAGGED = 1 << 3;
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const RECV = 1 << 10;
        const SEND = 1 << 11;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
    }
}

bitflags! {
    /// Remote access rights granted by a memory registration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemAccess: u64 {
        const READ = 1 << 8;
        const WRITE = 1 << 9;
        const REMOTE_READ = 1 << 12;
        const REMOTE_WRITE = 1 << 13;
    }
}

bitflags! {
    /// Completion queue bind flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BindFlags: u64 {
        const TRANSMIT = 1 << 11;
        const RECV = 1 << 10;
    }
}

bitflags! {
    /// Message ordering guarantees.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MsgOrder: u64 {
        /// Send after send.
        const SAS = 1 << 9;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_contains() {
        let caps = Capabilities::TAGGED | Capabilities::RMA | Capabilities::SOURCE;
        assert!(caps.contains(Capabilities::TAGGED | Capabilities::SOURCE));
        assert!(!caps.contains(Capabilities::ATOMIC));
    }

    #[test]
    fn test_completion_flags_overlap() {
        let send = CompletionFlags::SEND | CompletionFlags::TAGGED;
        assert!(send.intersects(CompletionFlags::SEND));
        assert!(!send.intersects(CompletionFlags::RECV | CompletionFlags::READ));
    }
}
