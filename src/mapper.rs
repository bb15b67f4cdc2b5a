use std::collections::HashMap;

use crate::config::{SignalBinding, SignalDirection};
use crate::process_image::ProcessImage;

pub type InputCallback = Box<dyn Fn(bool) + Send>;

/// Binds logical signal names to process-image bits and dispatches
/// input-change callbacks after each cycle. Owned by the orchestrator so
/// callbacks always observe a fully updated input image.
#[derive(Default)]
pub struct IoMapper {
    bindings: HashMap<String, SignalBinding>,
    callbacks: HashMap<String, InputCallback>,
    previous_input_state: HashMap<String, bool>,
}

impl IoMapper {
    pub fn bind(&mut self, binding: SignalBinding) -> bool {
        if self.bindings.contains_key(&binding.logical_name) {
            return false;
        }
        self.bindings.insert(binding.logical_name.clone(), binding);
        true
    }

    pub fn set_output(&self, image: &mut ProcessImage, logical_name: &str, value: bool) -> bool {
        match self.bindings.get(logical_name) {
            Some(binding) if binding.direction == SignalDirection::Output => {
                image.write_output_bit(binding.byte_offset, binding.bit_offset, value)
            }
            _ => false,
        }
    }

    pub fn get_input(&self, image: &ProcessImage, logical_name: &str) -> Option<bool> {
        let binding = self.bindings.get(logical_name)?;
        if binding.direction != SignalDirection::Input {
            return None;
        }
        image.read_input_bit(binding.byte_offset, binding.bit_offset)
    }

    pub fn register_input_callback(&mut self, logical_name: &str, callback: InputCallback) -> bool {
        match self.bindings.get(logical_name) {
            Some(binding) if binding.direction == SignalDirection::Input => {
                self.callbacks.insert(logical_name.to_owned(), callback);
                true
            }
            _ => false,
        }
    }

    /// Fire callbacks for every registered input whose value differs from
    /// the last dispatched state. The first observation always fires.
    pub fn dispatch_input_changes(&mut self, image: &ProcessImage) {
        for (name, callback) in &self.callbacks {
            let binding = match self.bindings.get(name) {
                Some(binding) if binding.direction == SignalDirection::Input => binding,
                _ => continue,
            };
            let current = match image.read_input_bit(binding.byte_offset, binding.bit_offset) {
                Some(value) => value,
                None => continue,
            };
            let changed = self.previous_input_state.get(name) != Some(&current);
            if changed {
                callback(current);
                self.previous_input_state.insert(name.clone(), current);
            }
        }
    }
}

impl core::fmt::Debug for IoMapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoMapper")
            .field("bindings", &self.bindings.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalBinding;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn mapper() -> IoMapper {
        let mut mapper = IoMapper::default();
        assert!(mapper.bind(SignalBinding::input("InputA", "EL1008", 0, 0)));
        assert!(mapper.bind(SignalBinding::output("OutputA", "EL2008", 0, 0)));
        mapper
    }

    #[test]
    fn direction_is_enforced() {
        let mapper = mapper();
        let mut image = ProcessImage::new(1, 1);
        assert!(!mapper.set_output(&mut image, "InputA", true));
        assert!(mapper.get_input(&image, "OutputA").is_none());
        assert!(mapper.set_output(&mut image, "OutputA", true));
        assert_eq!(mapper.get_input(&image, "InputA"), Some(false));
    }

    #[test]
    fn duplicate_binding_rejected() {
        let mut mapper = mapper();
        assert!(!mapper.bind(SignalBinding::input("InputA", "EL1008", 0, 1)));
    }

    #[test]
    fn callbacks_fire_only_on_change() {
        let mut mapper = mapper();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        assert!(mapper
            .register_input_callback("InputA", Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })));

        let mut image = ProcessImage::new(1, 1);
        image.input_bytes_mut()[0] = 0x01;
        mapper.dispatch_input_changes(&image);
        mapper.dispatch_input_changes(&image);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        image.input_bytes_mut()[0] = 0x00;
        mapper.dispatch_input_changes(&image);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_on_output_signal_rejected() {
        let mut mapper = mapper();
        assert!(!mapper.register_input_callback("OutputA", Box::new(|_| {})));
    }
}
