use crate::sync::OrderedMutex;
use crate::types::{CodeChannel, MacroHandle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One executing macro file. Codes that carry this macro's handle serialize
/// on the gate below instead of the channel's Macro class lock, so nested
/// macros only serialize with their own siblings.
pub struct MacroState {
    pub handle: MacroHandle,
    pub file_name: String,
    pub path: PathBuf,
    pub channel: CodeChannel,
    pub start_lock: Arc<OrderedMutex>,
    pub finish_lock: Arc<OrderedMutex>,
}

/// Arena of running macros. Handles are slot indices; codes store the index
/// and look the macro up on each access, so no owning cycles can form.
pub struct MacroArena {
    slots: Mutex<Vec<Option<Arc<MacroState>>>>,
}

impl MacroArena {
    pub fn new() -> MacroArena {
        MacroArena {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn allocate(
        &self,
        file_name: impl Into<String>,
        path: PathBuf,
        channel: CodeChannel,
    ) -> Arc<MacroState> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                slots.push(None);
                slots.len() - 1
            });
        let state = Arc::new(MacroState {
            handle: MacroHandle(index),
            file_name: file_name.into(),
            path,
            channel,
            start_lock: OrderedMutex::new(),
            finish_lock: OrderedMutex::new(),
        });
        slots[index] = Some(state.clone());
        state
    }

    pub fn get(&self, handle: MacroHandle) -> Option<Arc<MacroState>> {
        self.slots
            .lock()
            .unwrap()
            .get(handle.0)
            .and_then(Clone::clone)
    }

    pub fn release(&self, handle: MacroHandle) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(handle.0) {
            *slot = None;
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

impl Default for MacroArena {
    fn default() -> MacroArena {
        MacroArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused() {
        let arena = MacroArena::new();
        let a = arena.allocate("a.g", PathBuf::from("/m/a.g"), CodeChannel::File);
        let b = arena.allocate("b.g", PathBuf::from("/m/b.g"), CodeChannel::File);
        assert_eq!(a.handle.index(), 0);
        assert_eq!(b.handle.index(), 1);
        assert_eq!(arena.active_count(), 2);

        arena.release(a.handle);
        assert!(arena.get(a.handle).is_none());

        let c = arena.allocate("c.g", PathBuf::from("/m/c.g"), CodeChannel::File);
        assert_eq!(c.handle.index(), 0);
        assert_eq!(arena.get(c.handle).unwrap().file_name, "c.g");
    }
}
