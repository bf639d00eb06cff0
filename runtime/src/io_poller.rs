/*
 *   Copyright (c) 2024 The weave-rt Authors
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! I/O Poller — registers read/write interest on raw descriptors and reports
//! readiness with a bounded wait. Backed by `mio`'s raw epoll/kqueue wrapper: one
//! `mio::Poll`, `SourceFd` views onto externally-owned fds, no ownership of the fd
//! itself.

use std::{
    collections::HashMap,
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use mio::{event::Source, unix::SourceFd, Events, Interest, Token};

/// What interest a registration expresses on its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    Read,
    Write,
    Both,
}

impl IoInterest {
    fn to_mio(self) -> Interest {
        match self {
            IoInterest::Read => Interest::READABLE,
            IoInterest::Write => Interest::WRITABLE,
            IoInterest::Both => Interest::READABLE.add(Interest::WRITABLE),
        }
    }
}

/// Which side(s) of a registration became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoReadiness {
    pub readable: bool,
    pub writable: bool,
}

/// Opaque handle returned by [`IoPoller::register`], used to `unregister` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(usize);

pub type IoCallback = Box<dyn FnMut(IoReadiness)>;

struct Registration {
    fd: RawFd,
    one_shot: bool,
    callback: Rc<std::cell::RefCell<IoCallback>>,
}

/// Owns a `mio::Poll` and the registration table; the loop calls
/// `poll(max_wait)` once per iteration and gets back thunks
/// ready to enqueue onto the micro-task queue.
pub struct IoPoller {
    poll: mio::Poll,
    events: Events,
    registrations: HashMap<IoToken, Registration>,
    next_token: usize,
}

impl IoPoller {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(256),
            registrations: HashMap::new(),
            next_token: 0,
        })
    }

    /// Registers `fd` for `interest`. `callback` fires on every matching readiness
    /// unless `one_shot` is set, in which case the registration is removed the first
    /// time it fires.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: IoInterest,
        one_shot: bool,
        callback: IoCallback,
    ) -> std::io::Result<IoToken> {
        let token = IoToken(self.next_token);
        self.next_token += 1;

        SourceFd(&fd).register(self.poll.registry(), Token(token.0), interest.to_mio())?;
        self.registrations.insert(
            token,
            Registration { fd, one_shot, callback: Rc::new(std::cell::RefCell::new(callback)) },
        );
        Ok(token)
    }

    pub fn unregister(&mut self, token: IoToken) -> std::io::Result<()> {
        if let Some(registration) = self.registrations.remove(&token) {
            SourceFd(&registration.fd).deregister(self.poll.registry())?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool { self.registrations.is_empty() }

    /// Blocks up to `max_wait` (`None` means block indefinitely, `Some(ZERO)` means
    /// non-blocking) and returns one thunk per ready registration, each invoking its
    /// callback with the observed readiness.
    pub fn poll(&mut self, max_wait: Option<Duration>) -> std::io::Result<Vec<Box<dyn FnOnce()>>> {
        match self.poll.poll(&mut self.events, max_wait) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready = Vec::new();
        let mut to_unregister = Vec::new();
        for event in self.events.iter() {
            let token = IoToken(event.token().0);
            let Some(registration) = self.registrations.get(&token) else { continue };

            let readiness =
                IoReadiness { readable: event.is_readable(), writable: event.is_writable() };
            let callback = registration.callback.clone();
            ready.push(Box::new(move || (callback.borrow_mut())(readiness)) as Box<dyn FnOnce()>);

            if registration.one_shot {
                to_unregister.push(token);
            }
        }

        for token in to_unregister {
            self.unregister(token)?;
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn registers_and_reports_readiness_on_a_pipe() {
        let (mut read_end, mut write_end) = os_pipe();
        let mut poller = IoPoller::new().unwrap();

        let fired = Rc::new(std::cell::RefCell::new(None));
        let fired2 = fired.clone();
        poller
            .register(read_end.as_raw_fd(), IoInterest::Read, true, Box::new(move |r| *fired2.borrow_mut() = Some(r)))
            .unwrap();

        use std::io::Write;
        write_end.write_all(b"x").unwrap();

        let thunks = poller.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(thunks.len(), 1);
        for t in thunks {
            t();
        }
        assert_eq!(*fired.borrow(), Some(IoReadiness { readable: true, writable: false }));

        use std::io::Read;
        let mut buf = [0u8; 1];
        read_end.read_exact(&mut buf).unwrap();
    }

    fn os_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
    }
}
