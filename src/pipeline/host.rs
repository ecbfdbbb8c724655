//! Host-thread marshaling for [`ThreadAffinity::Host`] nodes.
//!
//! The traversal runs on one thread, but some nodes must execute on the
//! host's own thread (engines commonly require scene mutation there). The
//! runtime sends those calls over a channel as [`HostCall`]s and blocks on
//! the reply; the host pumps its end with [`HostExecutor::run_pending`] from
//! wherever it wants the work to happen.
//!
//! [`ThreadAffinity::Host`]: crate::pipeline::node::ThreadAffinity::Host

use crate::error::{Error, Result};
use crate::pipeline::node::{Emission, Emitter, NodeContext, Processor};
use crate::pipeline::payload::Payload;
use crate::provider::CancelToken;
use crate::types::{StreamEvent, SyncedData};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// A single processor hook invocation.
#[derive(Debug)]
pub enum NodeCall {
    Begin(u16),
    End(u16),
    Event(u16, SyncedData<Payload>, StreamEvent),
}

/// One marshaled call: the processor to run it on and where to reply.
pub struct HostCall {
    processor: Arc<Mutex<Box<dyn Processor>>>,
    call: NodeCall,
    cancel: CancelToken,
    reply: Sender<Result<Vec<Emission>>>,
}

/// Runtime-side handle; sends calls and waits for their emissions.
#[derive(Clone)]
pub struct HostBridge {
    calls: Sender<HostCall>,
}

impl HostBridge {
    /// Marshal one call and block until the host executes it.
    pub(crate) fn dispatch(
        &self,
        processor: &Arc<Mutex<Box<dyn Processor>>>,
        call: NodeCall,
        cancel: &CancelToken,
    ) -> Result<Vec<Emission>> {
        let (reply_tx, reply_rx) = bounded(1);
        let sent = self.calls.send(HostCall {
            processor: processor.clone(),
            call,
            cancel: cancel.clone(),
            reply: reply_tx,
        });
        if sent.is_err() {
            return Err(Error::InvalidState {
                expected: "host executor alive",
                actual: "host channel disconnected",
            });
        }
        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::InvalidState {
                expected: "host executor alive",
                actual: "host channel disconnected",
            }),
        }
    }
}

/// Host-side handle; executes marshaled calls on the pumping thread.
pub struct HostExecutor {
    calls: Receiver<HostCall>,
}

impl HostExecutor {
    /// Execute every queued call without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        for call in self.calls.try_iter() {
            execute(call);
            ran += 1;
        }
        ran
    }

    /// Block and execute calls until every bridge is dropped. Returns how
    /// many ran in total.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        while let Ok(call) = self.calls.recv() {
            execute(call);
            ran += 1;
        }
        ran
    }
}

fn execute(call: HostCall) {
    let HostCall {
        processor,
        call,
        cancel,
        reply,
    } = call;
    let mut processor = processor.lock().unwrap_or_else(|e| e.into_inner());
    let mut emitter = Emitter::new();
    let mut ctx = NodeContext {
        out: &mut emitter,
        cancel: &cancel,
    };
    trace!(?call, "executing marshaled call");
    let result = match call {
        NodeCall::Begin(port) => {
            processor.on_begin(port, &mut ctx);
            Ok(())
        }
        NodeCall::End(port) => {
            processor.on_end(port, &mut ctx);
            Ok(())
        }
        NodeCall::Event(port, data, event) => processor.on_event(port, &data, event, &mut ctx),
    };
    // A dropped receiver means the runtime gave up on the call; nothing to do.
    let _ = reply.send(result.map(|()| emitter.take()));
}

/// Create a connected bridge/executor pair.
pub fn host_channel() -> (HostBridge, HostExecutor) {
    let (tx, rx) = unbounded();
    (HostBridge { calls: tx }, HostExecutor { calls: rx })
}
