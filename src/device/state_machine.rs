use forge_shared::{DeviceEvent, DeviceState, StateTransitionError};

/// Connection/operational state of one device.
///
/// Besides the current state it remembers the pauseable state the device was
/// in when a pause was accepted, which is where `resume` returns to.
#[derive(Debug, Clone)]
pub struct DeviceStateMachine {
    device_id: String,
    state: DeviceState,
    pauseable_state: Option<DeviceState>,
}

impl DeviceStateMachine {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            state: DeviceState::Disconnected,
            pauseable_state: None,
        }
    }

    pub fn current(&self) -> DeviceState {
        self.state
    }

    pub fn pauseable_state(&self) -> Option<DeviceState> {
        self.pauseable_state
    }

    pub fn can(&self, event: DeviceEvent) -> bool {
        self.state.next(event).is_some()
    }

    pub fn fire(&mut self, event: DeviceEvent) -> Result<DeviceState, StateTransitionError> {
        let from = self.state;
        let mut to = from
            .next(event)
            .ok_or(StateTransitionError { event, from })?;
        match event {
            DeviceEvent::Pause => self.pauseable_state = Some(from),
            DeviceEvent::Resume => {
                if let Some(saved) = self.pauseable_state.take() {
                    to = saved;
                }
            }
            DeviceEvent::Disconnect => self.pauseable_state = None,
            _ => {}
        }
        self.state = to;
        tracing::info!("Device {}: {} ({} -> {})", self.device_id, event, from, to);
        Ok(to)
    }
}
