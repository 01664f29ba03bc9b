//! Lifecycle event catalog and the component state machine.
//!
//! Components move through `Stopped -> Starting -> Running -> Stopping ->
//! Stopped -> Unloaded`. Every transition the kernel performs is announced on
//! the event bus as one of the [`EventType`] lifecycle variants, carrying the
//! component id. Reference registries treat `ComponentRunning` as the sole
//! membership trigger and collapse `ComponentStopping`, `ComponentStopped`
//! and `ComponentUnloaded` into a single removal trigger.

#[derive(
    Debug, Clone, PartialEq, Hash, Eq, strum::EnumString, strum::Display, Default, PartialOrd, Ord,
)]
pub enum EventType {
    // Component lifecycle
    ComponentRegistered {
        component_id: String,
    },
    ComponentStarting {
        component_id: String,
    },
    ComponentRunning {
        component_id: String,
    },
    ComponentStopping {
        component_id: String,
    },
    ComponentStopped {
        component_id: String,
    },
    ComponentUnloaded {
        component_id: String,
    },
    // Registry membership
    MemberAdded {
        registry: String,
        component_id: String,
    },
    MemberRemoved {
        registry: String,
        component_id: String,
    },
    // KernelLifecycle
    #[default]
    KernelStarting,
    KernelStarted,
    KernelStopping,
    KernelStopped,
    Custom(String), // 拡張性のために残す
}

impl EventType {
    /// 対象コンポーネントのidを持つイベントならそのidを返す
    pub fn component_id(&self) -> Option<&str> {
        match self {
            EventType::ComponentRegistered { component_id }
            | EventType::ComponentStarting { component_id }
            | EventType::ComponentRunning { component_id }
            | EventType::ComponentStopping { component_id }
            | EventType::ComponentStopped { component_id }
            | EventType::ComponentUnloaded { component_id }
            | EventType::MemberAdded { component_id, .. }
            | EventType::MemberRemoved { component_id, .. } => Some(component_id),
            _ => None,
        }
    }
}

/// Kernel-side state of one registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ComponentState {
    /// Registered but not running. Initial state, and the state after a stop.
    Stopped,
    /// Start hook in progress.
    Starting,
    Running,
    /// Stop hook in progress.
    Stopping,
    /// Removed from the kernel; terminal.
    Unloaded,
}

impl ComponentState {
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped) // failed start hook
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Unloaded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ComponentState::Unloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ComponentState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Unloaded));
    }

    #[test]
    fn test_illegal_transitions() {
        use ComponentState::*;
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Unloaded.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Unloaded));
        assert!(Unloaded.is_terminal());
    }

    #[test]
    fn test_component_id_extraction() {
        let event = EventType::ComponentRunning {
            component_id: "worker-1".to_string(),
        };
        assert_eq!(event.component_id(), Some("worker-1"));
        assert_eq!(EventType::KernelStarted.component_id(), None);
    }
}
