//! # Request Router
//!
//! Clients connect to the frontend and send requests; chat servers attach to
//! the backend as workers. Each request goes to one worker, chosen round-robin,
//! and the worker's reply is returned to the client that asked.
//!
//! Frames are relayed untouched. A worker link serves one request at a time;
//! requests assigned to a busy worker wait in its queue. When a worker link
//! fails, the request in flight and everything queued behind it go back to
//! the dispatcher and are reassigned. Requests that arrive while no worker is
//! attached are held until one attaches.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::common::config::ClusterConfig;
use crate::common::connection::Connection;

/// A client request waiting for a worker's reply.
struct Job {
    frame: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

enum Dispatch {
    Job(Job),
    Attach(mpsc::UnboundedSender<Job>),
}

/// Round-robin assignment of jobs to attached workers.
#[derive(Default)]
struct Dispatcher {
    workers: Vec<mpsc::UnboundedSender<Job>>,
    next: usize,
    pending: VecDeque<Job>,
}

impl Dispatcher {
    fn attach(&mut self, worker: mpsc::UnboundedSender<Job>) {
        self.workers.push(worker);
        info!("🤝 Worker attached ({} total)", self.workers.len());

        while let Some(job) = self.pending.pop_front() {
            if let Some(job) = self.assign(job) {
                self.pending.push_front(job);
                break;
            }
        }
    }

    /// Hand `job` to the next live worker. Gives the job back if none is left.
    fn assign(&mut self, mut job: Job) -> Option<Job> {
        while !self.workers.is_empty() {
            let index = self.next % self.workers.len();
            match self.workers[index].send(job) {
                Ok(()) => {
                    self.next = index + 1;
                    return None;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.workers.remove(index);
                    warn!("⚠️  Worker detached ({} left)", self.workers.len());
                    job = returned;
                }
            }
        }
        Some(job)
    }

    fn submit(&mut self, job: Job) {
        if let Some(job) = self.assign(job) {
            debug!("⏳ No worker attached, holding request");
            self.pending.push_back(job);
        }
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    let mut dispatcher = Dispatcher::default();
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Job(job) => dispatcher.submit(job),
            Dispatch::Attach(worker) => dispatcher.attach(worker),
        }
    }
}

/// Bind the configured frontend and backend and relay forever.
pub async fn run(config: &ClusterConfig) -> Result<()> {
    let frontend = TcpListener::bind(&config.endpoints.router_frontend)
        .await
        .with_context(|| format!("binding router frontend {}", config.endpoints.router_frontend))?;
    let backend = TcpListener::bind(&config.endpoints.router_backend)
        .await
        .with_context(|| format!("binding router backend {}", config.endpoints.router_backend))?;
    serve(frontend, backend).await;
    Ok(())
}

/// Relay between already bound listeners. Returns only if a task dies.
pub async fn serve(frontend: TcpListener, backend: TcpListener) {
    if let (Ok(front), Ok(back)) = (frontend.local_addr(), backend.local_addr()) {
        info!("🚀 Router: clients on {}, servers on {}", front, back);
    }

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

    tokio::select! {
        _ = run_dispatcher(dispatch_rx) => error!("❌ Dispatcher terminated"),
        _ = accept_clients(frontend, dispatch_tx.clone()) => error!("❌ Frontend listener terminated"),
        _ = accept_workers(backend, dispatch_tx) => error!("❌ Backend listener terminated"),
    }
}

async fn accept_clients(listener: TcpListener, dispatch: mpsc::UnboundedSender<Dispatch>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("🔗 Client connected from {}", addr);
                tokio::spawn(handle_client(socket, dispatch.clone()));
            }
            Err(e) => error!("❌ Frontend accept error: {}", e),
        }
    }
}

async fn accept_workers(listener: TcpListener, dispatch: mpsc::UnboundedSender<Dispatch>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("🔗 Worker connected from {}", addr);
                let (job_tx, job_rx) = mpsc::unbounded_channel();
                if dispatch.send(Dispatch::Attach(job_tx)).is_err() {
                    return;
                }
                tokio::spawn(handle_worker(socket, job_rx, dispatch.clone()));
            }
            Err(e) => error!("❌ Backend accept error: {}", e),
        }
    }
}

/// One client link: each request is answered before the next is read.
async fn handle_client(socket: TcpStream, dispatch: mpsc::UnboundedSender<Dispatch>) {
    let mut conn = Connection::new(socket);

    loop {
        let frame = match conn.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("⚠️  Dropping client: {}", e);
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            frame,
            reply: reply_tx,
        };
        if dispatch.send(Dispatch::Job(job)).is_err() {
            return;
        }

        let Ok(reply) = reply_rx.await else {
            warn!("⚠️  Request abandoned without a reply");
            break;
        };
        if let Err(e) = conn.write_frame(&reply).await {
            warn!("⚠️  Failed to deliver reply to client: {}", e);
            break;
        }
    }
}

/// One worker link. On failure, the current job and any queued jobs are
/// handed back to the dispatcher.
async fn handle_worker(
    socket: TcpStream,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
) {
    let mut conn = Connection::new(socket);

    while let Some(job) = jobs.recv().await {
        let reply = match conn.write_frame(&job.frame).await {
            Ok(()) => conn.read_frame().await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(Some(reply)) => {
                // the client may have gone away; nothing to do then
                let _ = job.reply.send(reply);
            }
            Ok(None) | Err(_) => {
                warn!("⚠️  Worker link lost, reassigning its requests");
                jobs.close();
                let _ = dispatch.send(Dispatch::Job(job));
                while let Ok(queued) = jobs.try_recv() {
                    let _ = dispatch.send(Dispatch::Job(queued));
                }
                return;
            }
        }
    }
}
