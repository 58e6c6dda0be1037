use std::fmt;

/// Lifecycle of one collision pass.
///
/// ```text
/// Idle -> Locking -> Scanning -> Resolving -> Cleaning -> Done
///            \          \           \            \
///             `----------`-----------`------------`--> Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassState {
    Idle,
    Locking,
    Scanning,
    Resolving,
    Cleaning,
    Done,
    Errored,
}

impl PassState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PassState::Done | PassState::Errored)
    }

    pub fn can_transition_to(self, next: PassState) -> bool {
        use PassState::*;
        match (self, next) {
            (Idle, Locking) => true,
            (Locking, Scanning) => true,
            (Scanning, Resolving) => true,
            // A failure anywhere before Done still cleans up first.
            (Locking | Scanning | Resolving, Cleaning) => true,
            (Cleaning, Done | Errored) => true,
            (Idle | Locking, Errored) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassState::Idle => "idle",
            PassState::Locking => "locking",
            PassState::Scanning => "scanning",
            PassState::Resolving => "resolving",
            PassState::Cleaning => "cleaning",
            PassState::Done => "done",
            PassState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PassState::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [Idle, Locking, Scanning, Resolving, Cleaning, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn errors_always_pass_through_cleaning() {
        assert!(Resolving.can_transition_to(Cleaning));
        assert!(Cleaning.can_transition_to(Errored));
        assert!(!Resolving.can_transition_to(Errored));
        assert!(!Scanning.can_transition_to(Done));
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [Idle, Locking, Scanning, Resolving, Cleaning, Done, Errored] {
            assert!(!Done.can_transition_to(next));
            assert!(!Errored.can_transition_to(next));
        }
        assert!(Done.is_terminal() && Errored.is_terminal());
        assert!(!Cleaning.is_terminal());
    }
}
