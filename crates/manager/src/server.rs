//! The listening socket and one reader and writer per connected worker.

use std::{net::SocketAddr, time::Duration};

use error_stack::{Report, ResultExt};
use kiln_worker::{
    bundle::{body_len, scan_path},
    protocol::{FrameReader, FrameWriter, ManagerMessage, WorkerMessage},
    Bundle, TaskId, WorkerId,
};
use tokio::{
    io::AsyncWrite,
    net::{TcpListener, TcpStream},
    time::{Instant, MissedTickBehavior},
};
use tracing::{event, instrument, Level};

use crate::{
    artifact::{store_outputs, HashJob, HashOutcome, Payload},
    error::TransferError,
    monitor,
    registry::Outgoing,
    scheduler,
    state::SharedState,
    task::TaskState,
};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn accept_loop(listener: TcpListener, state: SharedState) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(stream, addr, state.clone()));
            }
            Err(e) => {
                event!(Level::WARN, error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

/// Periodically remove workers that have stopped sending heartbeats, and retry dispatch in
/// case anything is waiting.
pub(crate) async fn liveness_loop(state: SharedState, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut state = state.lock();
        for worker_id in state.workers.expired(Instant::now(), timeout) {
            monitor::worker_lost(&mut state, worker_id, "heartbeat timeout");
        }
        scheduler::dispatch(&mut state);
    }
}

/// Fingerprint path artifacts as the scheduler asks for them, each on the blocking pool, and
/// dispatch again once a result is recorded.
pub(crate) async fn hash_loop(state: SharedState, jobs: flume::Receiver<HashJob>) {
    while let Ok(job) = jobs.recv_async().await {
        let state = state.clone();
        tokio::spawn(async move {
            let (handle, generation) = (job.handle, job.generation);
            let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(outcome) => outcome,
                Err(e) => HashOutcome {
                    handle,
                    generation,
                    result: Err(Report::new(e).change_context(TransferError::Load)),
                },
            };

            let mut state = state.lock();
            if let Err(e) = state.artifacts.finish_hash(outcome) {
                event!(Level::WARN, %handle, error = ?e, "failed to hash artifact");
                state.fail_waiting_on(handle, &format!("{e:?}"));
            }
            scheduler::dispatch(&mut state);
        });
    }
}

#[instrument(level = "debug", skip(stream, state))]
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: SharedState) {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let (name, resources, cache_capacity, cached) = match reader.recv::<WorkerMessage>().await {
        Ok(Some((
            WorkerMessage::Register {
                name,
                resources,
                cache_capacity,
                cached,
            },
            _,
        ))) => (name, resources, cache_capacity, cached),
        Ok(Some((other, _))) => {
            event!(Level::WARN, received = ?other, "expected worker registration");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            event!(Level::WARN, error = ?e, "failed to read worker registration");
            return;
        }
    };

    let (outbox_tx, outbox_rx) = flume::unbounded();
    let worker_id = {
        let mut state = state.lock();
        let manager_name = state.config.name.clone();
        let worker_id =
            state
                .workers
                .register(name, resources, cache_capacity, &cached, outbox_tx.clone());
        outbox_tx
            .send(Outgoing::Message(ManagerMessage::Welcome {
                worker_id,
                manager_name,
            }))
            .ok();
        scheduler::dispatch(&mut state);
        worker_id
    };
    // The registry now holds the only sender, so removing the worker ends its writer.
    drop(outbox_tx);

    let mut writer_task = tokio::spawn(write_loop(
        FrameWriter::new(write_half),
        outbox_rx,
        state.clone(),
        worker_id,
    ));

    let reason = loop {
        tokio::select! {
            frame = reader.recv::<WorkerMessage>() => match frame {
                Ok(Some((message, body))) => {
                    if let Some(reason) = handle_message(&state, worker_id, message, body).await {
                        break reason;
                    }
                }
                Ok(None) => break "connection closed",
                Err(e) => {
                    event!(Level::WARN, %worker_id, error = ?e, "failed to read from worker");
                    break "protocol error";
                }
            },
            _ = &mut writer_task => break "connection writer stopped",
        }
    };

    {
        let mut state = state.lock();
        monitor::worker_lost(&mut state, worker_id, reason);
        scheduler::dispatch(&mut state);
    }
    writer_task.abort();
}

/// Apply one message from a worker. Returns the reason to drop the connection, if it should be.
async fn handle_message(
    state: &SharedState,
    worker_id: WorkerId,
    message: WorkerMessage,
    body: Vec<u8>,
) -> Option<&'static str> {
    match message {
        WorkerMessage::Heartbeat { cached, running } => {
            event!(Level::TRACE, %worker_id, cached = cached.len(), running = running.len(), "heartbeat");
            state.lock().workers.heartbeat(worker_id, Some(&cached));
        }
        WorkerMessage::TransferFailed { fingerprint, error } => {
            let mut state = state.lock();
            state.workers.heartbeat(worker_id, None);
            let error = Report::new(TransferError::Worker).attach_printable(error);
            monitor::transfer_failed(&mut state, worker_id, &fingerprint, error);
            scheduler::dispatch(&mut state);
        }
        WorkerMessage::Output {
            task_id,
            binding,
            entries,
        } => {
            let bundle = Bundle { entries, body };
            let mut state = state.lock();
            state.workers.heartbeat(worker_id, None);
            monitor::handle_output(&mut state, worker_id, task_id, binding, bundle);
        }
        WorkerMessage::Result {
            task_id,
            outcome,
            stdout,
            stats,
        } => {
            let run = {
                let mut state = state.lock();
                state.workers.heartbeat(worker_id, None);
                monitor::take_result(&mut state, worker_id, task_id, outcome, stdout, stats)
            };

            if let Some(mut run) = run {
                let writes = std::mem::take(&mut run.writes);
                let stored = match tokio::task::spawn_blocking(move || store_outputs(writes)).await {
                    Ok(stored) => stored,
                    Err(e) => Err(Report::new(e).change_context(TransferError::Store)),
                };

                let mut state = state.lock();
                monitor::complete(&mut state, run, stored);
                scheduler::dispatch(&mut state);
            }
        }
        WorkerMessage::Register { .. } => {
            event!(Level::WARN, %worker_id, "worker registered twice");
            return Some("unexpected registration");
        }
        WorkerMessage::Disconnect => return Some("worker disconnected"),
    }

    None
}

/// Whether a queued dispatch is still current. A task can be failed or cancelled while its
/// dispatch waits in the outbox, for instance when a transfer queued ahead of it fails.
fn still_assigned(state: &SharedState, worker_id: WorkerId, task_id: TaskId) -> bool {
    state
        .lock()
        .tasks
        .get(&task_id)
        .is_some_and(|record| record.state == TaskState::Running { worker: worker_id })
}

/// Drain a worker's outbox onto its connection. Path artifacts are streamed from disk here,
/// outside the manager lock.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    outbox: flume::Receiver<Outgoing>,
    state: SharedState,
    worker_id: WorkerId,
) {
    while let Ok(outgoing) = outbox.recv_async().await {
        let sent = match outgoing {
            Outgoing::Message(ManagerMessage::Dispatch(spec)) => {
                if !still_assigned(&state, worker_id, spec.task_id) {
                    event!(Level::DEBUG, %worker_id, task_id = %spec.task_id, "dropping dispatch of a task that is no longer assigned");
                    continue;
                }
                writer.send(&ManagerMessage::Dispatch(spec), &[]).await
            }
            Outgoing::Message(message) => writer.send(&message, &[]).await,
            Outgoing::Put {
                fingerprint,
                unpack,
                payload: Payload::Loaded(bundle),
            } => {
                event!(Level::DEBUG, %worker_id, %fingerprint, size = bundle.size(), "sending artifact");
                let message = ManagerMessage::Put {
                    fingerprint,
                    unpack,
                    entries: bundle.entries.clone(),
                };
                writer.send(&message, &bundle.body).await
            }
            Outgoing::Put {
                fingerprint,
                unpack,
                payload: Payload::Path(path),
            } => {
                let scanned = {
                    let target = path.clone();
                    match tokio::task::spawn_blocking(move || scan_path(&target)).await {
                        Ok(scanned) => scanned
                            .change_context(TransferError::Load)
                            .attach_printable_lazy(|| format!("Reading {}", path.display())),
                        Err(e) => Err(Report::new(e).change_context(TransferError::Load)),
                    }
                };

                let entries = match scanned {
                    Ok(entries) => entries,
                    Err(e) => {
                        let mut state = state.lock();
                        monitor::transfer_failed(&mut state, worker_id, &fingerprint, e);
                        scheduler::dispatch(&mut state);
                        continue;
                    }
                };

                event!(Level::DEBUG, %worker_id, %fingerprint, size = body_len(&entries), "sending artifact");
                let message = ManagerMessage::Put {
                    fingerprint: fingerprint.clone(),
                    unpack,
                    entries: entries.clone(),
                };
                writer
                    .send_tree(&message, &path, &entries)
                    .await
                    .map(|intact| {
                        if !intact {
                            event!(Level::WARN, %worker_id, %fingerprint, path = %path.display(), "artifact changed while it was sent");
                        }
                    })
            }
        };

        if let Err(e) = sent {
            event!(Level::WARN, %worker_id, error = ?e, "failed to write to worker");
            break;
        }
    }

    writer.shutdown().await;
}
