//! Which clients the dispatcher looks at, and in what order.
//!
//! A client is ready when it may have a request to process. While a grab
//! is in progress only the grabbing client and grab-impervious clients
//! stay ready; everyone else is parked in the saved set and comes back when
//! the grab ends. Ignored clients are neither read nor serviced.

use crate::client::{ClientId, Serviceability};
use crate::manager::ConnectionManager;
use crate::poll::Interest;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub(crate) struct Schedule {
    pub(crate) ready: BTreeSet<ClientId>,
    pub(crate) saved_ready: BTreeSet<ClientId>,
    pub(crate) grab: Option<ClientId>,
    pub(crate) yield_now: bool,
    last_serviced: Option<ClientId>,
}

impl Schedule {
    pub(crate) fn forget(&mut self, id: ClientId) {
        self.ready.remove(&id);
        self.saved_ready.remove(&id);
        if self.last_serviced == Some(id) {
            self.last_serviced = None;
        }
    }
}

impl ConnectionManager {
    /// Whether requests from `id` may be read right now.
    pub fn listen_to_client(&self, id: ClientId) -> bool {
        let Some(client) = self.client(id) else {
            return false;
        };
        if client.ignore_count > 0 {
            return false;
        }
        match self.sched.grab {
            None => true,
            Some(grab) => grab == id || client.grab_impervious,
        }
    }

    pub fn serviceability(&self, id: ClientId) -> Serviceability {
        let Some(client) = self.client(id) else {
            return Serviceability::Ignored;
        };
        let ignored = client.ignore_count > 0;
        let excluded = self
            .sched
            .grab
            .is_some_and(|grab| grab != id && !client.grab_impervious);
        match (ignored, excluded) {
            (false, false) => Serviceability::Attending,
            (true, false) => Serviceability::Ignored,
            (false, true) => Serviceability::GrabExcluded,
            (true, true) => Serviceability::IgnoredAndGrabExcluded,
        }
    }

    /// Watch the client's socket for input only while it is listened to.
    pub(crate) fn set_poll_client(&mut self, id: ClientId) {
        let Some(client) = self.client(id) else {
            return;
        };
        if !client.conn.is_open() {
            return;
        }
        let fd = client.conn.fd;
        if self.listen_to_client(id) {
            self.poller.listen(fd, Interest::READABLE);
        } else {
            self.poller.mute(fd, Interest::READABLE);
        }
    }

    fn set_poll_clients(&mut self) {
        let ids: Vec<ClientId> = self.clients().map(|c| c.id).collect();
        for id in ids {
            self.set_poll_client(id);
        }
    }

    pub fn mark_client_ready(&mut self, id: ClientId) {
        self.sched.saved_ready.remove(&id);
        self.sched.ready.insert(id);
    }

    /// Park a client that has input but is shut out by a grab.
    pub fn mark_client_saved_ready(&mut self, id: ClientId) {
        self.sched.ready.remove(&id);
        self.sched.saved_ready.insert(id);
    }

    pub fn mark_client_not_ready(&mut self, id: ClientId) {
        self.sched.ready.remove(&id);
        self.sched.saved_ready.remove(&id);
    }

    pub fn is_client_ready(&self, id: ClientId) -> bool {
        self.sched.ready.contains(&id)
    }

    pub fn is_client_saved_ready(&self, id: ClientId) -> bool {
        self.sched.saved_ready.contains(&id)
    }

    pub fn clients_are_ready(&self) -> bool {
        !self.sched.ready.is_empty()
    }

    /// Start a grab: from now on only `id` and grab-impervious clients are
    /// read and serviced. Nested grabs are ignored.
    pub fn only_listen_to_one_client(&mut self, id: ClientId) {
        if self.sched.grab.is_some() || self.client(id).is_none() {
            return;
        }
        log::debug!("grab by {}", id);
        self.sched.grab = Some(id);
        self.set_poll_clients();

        let parked: Vec<ClientId> = self
            .sched
            .ready
            .iter()
            .copied()
            .filter(|&c| !self.listen_to_client(c))
            .collect();
        for c in parked {
            self.mark_client_saved_ready(c);
        }
    }

    /// End a grab and bring parked clients back.
    pub fn listen_to_all_clients(&mut self) {
        let Some(grab) = self.sched.grab.take() else {
            return;
        };
        log::debug!("grab by {} released", grab);
        self.set_poll_clients();
        let saved = std::mem::take(&mut self.sched.saved_ready);
        self.sched.ready.extend(saved);
    }

    pub fn grab(&self) -> Option<ClientId> {
        self.sched.grab
    }

    /// Stop reading from a client. Counted; each call needs a matching
    /// [`attend_client`](Self::attend_client).
    pub fn ignore_client(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.ignore_count += 1;
        if client.ignore_count > 1 {
            return;
        }
        self.sched.yield_now = true;
        self.mark_client_not_ready(id);
        self.set_poll_client(id);
    }

    pub fn attend_client(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        if client.ignore_count == 0 {
            return;
        }
        client.ignore_count -= 1;
        if client.ignore_count > 0 {
            return;
        }
        self.set_poll_client(id);
        // input may already sit in the buffer, so have a look
        if self.listen_to_client(id) {
            self.mark_client_ready(id);
        } else {
            self.mark_client_saved_ready(id);
        }
    }

    /// Keep servicing a client even while another holds a grab.
    pub fn make_client_grab_impervious(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.grab_impervious = true;
        self.set_poll_client(id);
        if self.is_client_saved_ready(id) && self.listen_to_client(id) {
            self.mark_client_ready(id);
        }
    }

    pub fn make_client_grab_pervious(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.grab_impervious = false;
        self.set_poll_client(id);
        if self.is_client_ready(id) && !self.listen_to_client(id) {
            self.mark_client_saved_ready(id);
        }
        self.sched.yield_now = true;
    }

    /// Ask the dispatcher to move on to the next client.
    pub fn yield_control(&mut self) {
        self.sched.yield_now = true;
    }

    /// Yield, and reset the edge state of the client's socket so new data
    /// arriving later is reported again.
    pub(crate) fn yield_control_no_input(&mut self, id: ClientId) {
        self.sched.yield_now = true;
        if let Some(client) = self.client(id) {
            if client.conn.is_open() {
                let fd = client.conn.fd;
                self.poller.reset_events(fd);
            }
        }
    }

    pub fn is_it_time_to_yield(&self) -> bool {
        self.sched.yield_now
    }

    pub(crate) fn clear_yield(&mut self) {
        self.sched.yield_now = false;
    }

    /// Ready clients in service order: round robin, starting after the one
    /// serviced last.
    pub fn ready_clients(&self) -> Vec<ClientId> {
        let ready = &self.sched.ready;
        match self.sched.last_serviced {
            Some(last) => ready
                .range(last..)
                .filter(|&&c| c != last)
                .chain(ready.range(..=last))
                .copied()
                .collect(),
            None => ready.iter().copied().collect(),
        }
    }

    pub(crate) fn set_last_serviced(&mut self, id: ClientId) {
        self.sched.last_serviced = Some(id);
    }
}
