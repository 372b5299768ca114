//! Shared setup for backend integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use hwc_backend::buffer::fourcc;
use hwc_backend::device::headless::{HeadlessComposer, HeadlessConfig, HeadlessProbe};
use hwc_backend::{Backend, BackendConfig, FrameEvent, GraphicsBuffer, ImportedBuffer};

pub fn backend_with(headless: HeadlessConfig, config: BackendConfig) -> (Backend, HeadlessProbe) {
    let device = HeadlessComposer::new(headless);
    let probe = device.probe();
    let backend = Backend::new(Box::new(device), config).expect("backend init");
    (backend, probe)
}

pub fn backend(headless: HeadlessConfig) -> (Backend, HeadlessProbe) {
    backend_with(headless, BackendConfig::default())
}

pub fn argb(handle: u64, width: u32, height: u32) -> Arc<dyn GraphicsBuffer> {
    Arc::new(ImportedBuffer::single_plane(handle, width, height, fourcc::ARGB8888))
}

/// Handler that records every event it sees.
pub fn recorder() -> (
    Arc<Mutex<Vec<FrameEvent>>>,
    impl FnMut(&FrameEvent) + Send + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &FrameEvent| {
        sink.lock().unwrap().push(*event);
    })
}

/// The event fd is readable right now.
pub fn readable(fd: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
}
