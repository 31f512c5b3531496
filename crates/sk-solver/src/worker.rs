//! Background sweep worker
//!
//! A sweep runs on its own thread with its own copy of the engine context
//! and streams results back over a channel. Dropping the handle abandons the
//! sweep; samples already received stay valid.

use std::ops::ControlFlow;
use std::sync::mpsc::{self, Receiver, RecvError, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::context::{EngineContext, EngineError};
use crate::sweep::{SweepRequest, SweepResponse, SweepSample};

/// Message from a sweep worker
#[derive(Debug, Clone)]
pub enum SweepEvent {
    /// A feasible value was accepted
    Accepted(SweepSample),
    /// The sweep ended
    Finished(SweepResponse),
    /// The sweep could not run
    Failed(EngineError),
}

/// Handle to a running sweep
pub struct SweepHandle {
    receiver: Receiver<SweepEvent>,
    thread: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Block until the next event
    pub fn recv(&self) -> Result<SweepEvent, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<SweepEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain events until the sweep ends and return its response
    pub fn wait(mut self) -> Result<SweepResponse, EngineError> {
        let mut result = Err(EngineError::InvalidSweep("worker exited early".to_string()));
        for event in self.receiver.iter() {
            match event {
                SweepEvent::Accepted(_) => {}
                SweepEvent::Finished(response) => {
                    result = Ok(response);
                    break;
                }
                SweepEvent::Failed(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Sweep worker panicked");
        }
        result
    }
}

/// Run `request` on a worker thread that owns `context`
pub fn spawn_sweep(context: EngineContext, request: SweepRequest) -> SweepHandle {
    let (sender, receiver) = mpsc::channel();
    let thread = thread::spawn(move || {
        let result = context.solve_max_v_with(&request, |sample| {
            if sender.send(SweepEvent::Accepted(sample.clone())).is_err() {
                tracing::debug!("Sweep '{}' abandoned", request.test_id);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        let event = match result {
            Ok(response) => SweepEvent::Finished(response),
            Err(e) => SweepEvent::Failed(e),
        };
        // the receiver may already be gone
        let _ = sender.send(event);
    });
    SweepHandle {
        receiver,
        thread: Some(thread),
    }
}
