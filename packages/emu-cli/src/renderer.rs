//! Stands in for the host-window renderer (§4.11): owns a clone of the
//! CGA mode register and the framebuffer bridge (component J), and
//! periodically logs a one-line summary of both, which exercises the
//! same mutex/rwlock-sharing contract a real SDL renderer would use
//! without pulling in a GUI toolkit.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Renderer {
    handle: Option<JoinHandle<()>>,
}

impl Renderer {
    pub fn start(mode_register: Arc<Mutex<u8>>, framebuffer: Arc<RwLock<Vec<u8>>>) -> Renderer {
        let handle = thread::spawn(move || loop {
            thread::sleep(Duration::from_millis(500));
            let mode = *mode_register.lock().unwrap();
            let checksum = framebuffer
                .read()
                .unwrap()
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
            log::debug!(
                "renderer: mode register = {:#04X}, framebuffer checksum = {:#010X}",
                mode,
                checksum
            );
        });
        Renderer {
            handle: Some(handle),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // The background thread has no shutdown channel- it's a stub
        // standing in for a real windowing loop, and detaching it on
        // drop is fine since the process is exiting anyway.
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
    }
}
