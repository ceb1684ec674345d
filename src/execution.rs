//! Senders, receivers and operations.
//!
//! A sender is any future resolving to [`Result`]: a description of work
//! that does nothing until started. [`connect`] pairs it with a
//! [`Receiver`], and [`Operation::start`] runs it on a [`Scheduler`],
//! delivering exactly one of value, error or stopped to the receiver.

pub mod run_loop;
pub mod stop;

use std::future::Future;

use crate::error::{Error, Result};

pub use run_loop::{RunLoop, Scheduler};
pub use stop::{StopSource, StopToken};

/// The three ways an operation can end.
#[derive(Debug, PartialEq)]
pub enum Completion<T> {
    Value(T),
    Error(Error),
    Stopped,
}

impl<T> From<Result<T>> for Completion<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Completion::Value(value),
            Err(Error::Stopped) => Completion::Stopped,
            Err(error) => Completion::Error(error),
        }
    }
}

impl<T> Completion<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Completion::Value(value) => Ok(value),
            Completion::Error(error) => Err(error),
            Completion::Stopped => Err(Error::Stopped),
        }
    }
}

pub trait Receiver<T>: Send + 'static {
    fn set_value(self, value: T);
    fn set_error(self, error: Error);
    fn set_stopped(self);
}

/// Delivers `completion` to the matching receiver channel.
pub fn complete<T, R: Receiver<T>>(receiver: R, completion: Completion<T>) {
    match completion {
        Completion::Value(value) => receiver.set_value(value),
        Completion::Error(error) => receiver.set_error(error),
        Completion::Stopped => receiver.set_stopped(),
    }
}

/// A sender connected to its receiver, not yet started.
pub struct Operation<S, R> {
    sender: S,
    receiver: R,
}

pub fn connect<S, R>(sender: S, receiver: R) -> Operation<S, R> {
    Operation { sender, receiver }
}

impl<S, R, T> Operation<S, R>
where
    S: Future<Output = Result<T>> + Send + 'static,
    R: Receiver<T>,
    T: Send + 'static,
{
    pub fn start(self, scheduler: &Scheduler) {
        let Operation { sender, receiver } = self;
        scheduler.spawn(async move {
            let completion = Completion::from(sender.await);
            complete(receiver, completion);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Errno;
    use std::sync::mpsc;
    use test_log::test;

    struct Recorder(mpsc::Sender<Completion<u32>>);

    impl Receiver<u32> for Recorder {
        fn set_value(self, value: u32) {
            let _ = self.0.send(Completion::Value(value));
        }

        fn set_error(self, error: Error) {
            let _ = self.0.send(Completion::Error(error));
        }

        fn set_stopped(self) {
            let _ = self.0.send(Completion::Stopped);
        }
    }

    #[test]
    fn each_operation_completes_once() {
        let run_loop = RunLoop::new();
        let scheduler = run_loop.scheduler();
        let (tx, rx) = mpsc::channel();

        connect(async { Ok(7) }, Recorder(tx.clone())).start(&scheduler);
        connect(
            async { Err(Error::sd_bus("bus_call", Errno::EIO)) },
            Recorder(tx.clone()),
        )
        .start(&scheduler);
        connect(async { Err(Error::Stopped) }, Recorder(tx)).start(&scheduler);
        run_loop.finish();
        run_loop.run();

        let got: Vec<_> = rx.iter().collect();
        assert_eq!(
            got,
            vec![
                Completion::Value(7),
                Completion::Error(Error::sd_bus("bus_call", Errno::EIO)),
                Completion::Stopped,
            ]
        );
    }

    #[test]
    fn completion_converts_back() {
        assert_eq!(Completion::Value(1).into_result(), Ok(1));
        assert_eq!(Completion::<u8>::Stopped.into_result(), Err(Error::Stopped));
    }
}
