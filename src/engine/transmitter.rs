use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

use crate::engine::pending::{PendingRequest, PendingTable};
use crate::engine::{EngineConfig, EngineShared, PingResult};
use crate::icmp::{echo_payload, EchoReply, EchoRequest, Transport};

/// Something that settles a pending request.
#[derive(Debug)]
enum Completion {
    Reply { token: u64, reply: EchoReply },
    Expired { token: u64 },
}

/// Background worker issuing one echo request per registered target on
/// every interval tick and correlating the replies.
struct Transmitter {
    shared: Arc<EngineShared>,
    transport: Arc<dyn Transport>,
    pending: PendingTable,
}

fn ticker(period: Duration, start: tokio::time::Instant) -> Interval {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl Transmitter {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let (completions, mut finished) = mpsc::unbounded_channel();
        let mut period = self.shared.config().interval();
        let mut interval = ticker(period, tokio::time::Instant::now());

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let config = self.shared.config();
                    if config.interval() != period {
                        period = config.interval();
                        interval = ticker(period, tokio::time::Instant::now() + period);
                    }
                    self.transmit_round(&config, &completions);
                }
                Some(done) = finished.recv() => self.complete(done),
            }
        }

        let abandoned = self.pending.clear();
        if abandoned > 0 {
            log::debug!(
                "Engine {} stopped with {} requests in flight, discarding them",
                self.shared.id,
                abandoned
            );
        }
    }

    fn transmit_round(&mut self, config: &EngineConfig, completions: &mpsc::UnboundedSender<Completion>) {
        let targets = self.shared.targets();
        log::trace!(
            "Engine {} transmitting to {} targets, {} still pending",
            self.shared.id,
            targets.len(),
            self.pending.len()
        );

        let payload = echo_payload(config.payload_size);
        let timeout = config.timeout();

        for target in targets {
            let token = self.shared.next_sequence();

            // Registered before dispatch so an instant reply always finds it.
            self.pending.insert(
                token,
                PendingRequest {
                    target: Arc::downgrade(&target),
                    epoch: SystemTime::now(),
                    sent_at: Instant::now(),
                },
            );

            let request = EchoRequest {
                token,
                address: target.address(),
                ttl: target.ttl(),
                payload: payload.clone(),
                timeout,
            };

            let transport = Arc::clone(&self.transport);
            let replies = completions.clone();
            tokio::task::spawn_blocking(move || {
                let reply = transport.round_trip(&request);
                let _ = replies.send(Completion::Reply { token, reply });
            });

            let expiries = completions.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = expiries.send(Completion::Expired { token });
            });
        }
    }

    fn complete(&mut self, done: Completion) {
        let (token, reply) = match done {
            Completion::Reply { token, reply } => (token, Some(reply)),
            Completion::Expired { token } => (token, None),
        };

        let Some(request) = self.pending.take(token) else {
            log::trace!("Sequence {} already settled, dropping late completion", token);
            return;
        };

        let Some(target) = request.target.upgrade() else {
            log::debug!("Target of sequence {} is gone, discarding its result", token);
            return;
        };

        let back_reference = Some(Arc::downgrade(&target));
        let result = match reply {
            Some(reply) => PingResult::from_reply(token, &reply, request.epoch, back_reference, None),
            None => PingResult::no_reply(token, request.epoch, request.sent_at.elapsed(), back_reference, None),
        };

        if !self.shared.deliver(&target, result) {
            log::debug!("Target of sequence {} was removed, discarding its result", token);
        }
    }
}

/// A launched transmitter thread. Halting it always joins.
pub(crate) struct TransmitterHandle {
    stop: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

impl TransmitterHandle {
    pub(crate) fn launch(shared: Arc<EngineShared>, transport: Arc<dyn Transport>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (stop, stop_rx) = watch::channel(false);
        let name = format!("transmitter-{}", shared.id);
        let transmitter = Transmitter {
            shared,
            transport,
            pending: PendingTable::new(),
        };

        let thread = thread::Builder::new().name(name).spawn(move || {
            runtime.block_on(transmitter.run(stop_rx));
            // Blocking round trips still in the pool finish on their own;
            // their completions go to a closed channel.
            runtime.shutdown_background();
        })?;

        Ok(Self { stop, thread })
    }

    pub(crate) fn halt(self) {
        let _ = self.stop.send(true);
        if self.thread.join().is_err() {
            log::error!("Transmitter thread panicked");
        }
    }
}
