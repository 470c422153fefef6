use speedy::{Readable, Writable};

/// Event field of the announce request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Writable, Readable)]
pub enum Event {
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl Event {
    /// Value of the `event` query parameter in HTTP announces. Periodic
    /// announces carry no event.
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Completed => Some("completed"),
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values() {
        assert_eq!(Event::None.query_value(), None);
        assert_eq!(Event::Started.query_value(), Some("started"));
        assert_eq!(Event::Completed.query_value(), Some("completed"));
        assert_eq!(Event::Stopped.query_value(), Some("stopped"));
    }
}
