use crate::message::{Content, Message};
use std::sync::{Arc, Mutex, MutexGuard};

/// Terminal outcomes a delivery can settle with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disposition {
    None,
    Accepted,
    Rejected,
    Released,
    Modified,
}

impl Disposition {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        *self != Disposition::None
    }
}

struct DeliveryState {
    local: Disposition,
    remote: Disposition,
    settled: bool,
    context: Option<u64>,
}

/// A message's presence on one link. Shared between the sending and the
/// receiving side; the content stays alive until the longer-lived holder
/// drops its reference, at which point the message handle goes with it.
pub struct Delivery {
    message: Mutex<Message>,
    state: Mutex<DeliveryState>,
    created_tick: u64,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();

        f.debug_struct("Delivery")
            .field("local", &state.local)
            .field("remote", &state.remote)
            .field("settled", &state.settled)
            .field("context", &state.context)
            .finish()
    }
}

impl Delivery {
    pub fn new(message: Message, now_tick: u64) -> Arc<Delivery> {
        Arc::new(Delivery {
            message: Mutex::new(message),
            state: Mutex::new(DeliveryState {
                local: Disposition::None,
                remote: Disposition::None,
                settled: false,
                context: None,
            }),
            created_tick: now_tick,
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().expect("Delivery lock poisoned")
    }

    /// Run `f` against the delivery's message handle.
    pub fn with_message<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        f(&mut self.message.lock().expect("Delivery message lock poisoned"))
    }

    /// The shared content behind the delivery's message.
    pub fn content(&self) -> Arc<Content> {
        self.message
            .lock()
            .expect("Delivery message lock poisoned")
            .content()
            .clone()
    }

    #[inline]
    pub fn created_tick(&self) -> u64 {
        self.created_tick
    }

    /// Set the local disposition. The first terminal disposition wins;
    /// settled deliveries are immutable.
    pub fn set_local_disposition(&self, disposition: Disposition) -> bool {
        let mut state = self.lock();

        if state.settled || state.local.is_terminal() {
            return false;
        }

        state.local = disposition;
        true
    }

    /// Record the peer's disposition.
    pub fn set_remote_disposition(&self, disposition: Disposition) -> bool {
        let mut state = self.lock();

        if state.settled {
            return false;
        }

        state.remote = disposition;
        true
    }

    pub fn local_disposition(&self) -> Disposition {
        self.lock().local
    }

    pub fn remote_disposition(&self) -> Disposition {
        self.lock().remote
    }

    /// Settle the delivery. Returns false when it was already settled.
    pub fn settle(&self) -> bool {
        let mut state = self.lock();

        match state.settled {
            true => false,
            false => {
                state.settled = true;
                true
            }
        }
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.lock().settled
    }

    /// Attach the adaptor's correlation token (e.g. an HTTP/2 stream id).
    pub fn set_context(&self, context: u64) {
        self.lock().context = Some(context);
    }

    /// Detach the correlation token, returning what was attached.
    pub fn clear_context(&self) -> Option<u64> {
        self.lock().context.take()
    }

    pub fn context(&self) -> Option<u64> {
        self.lock().context
    }
}
