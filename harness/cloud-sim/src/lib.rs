//! In-process stand-in for the cloud and media-server HTTP surfaces the
//! `lk` binary talks to: Twirp RPCs, presigned source uploads, build and
//! deploy log streams and the device authorization endpoints.

mod error;
mod routes;
mod services;
mod state;

use std::net::TcpListener;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use error::SimError;
pub use routes::router;
pub use state::{
    CLAIMED_KEY, CLAIMED_PROJECT_ID, CLAIMED_PROJECT_NAME, CLAIMED_SECRET, Faults, PrivateLink,
    SimAgent, SimState, Upload,
};

/// A running simulator bound to an ephemeral loopback port. Dropping it
/// stops the server and joins its thread.
pub struct CloudSim {
    url: String,
    state: SimState,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CloudSim {
    pub fn start() -> Result<Self, SimError> {
        Self::start_with(Faults::default())
    }

    pub fn start_with(faults: Faults) -> Result<Self, SimError> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let url = format!("http://{}", listener.local_addr()?);
        let state = SimState::new(&url, faults);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let app = router(state.clone());
        let thread = std::thread::Builder::new()
            .name("cloud-sim".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "cloud-sim listener unusable");
                            return;
                        }
                    };
                    let shutdown = async {
                        let _ = stopped.await;
                    };
                    if let Err(err) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        warn!(error = %err, "cloud-sim stopped with an error");
                    }
                });
            })?;
        debug!(%url, "cloud-sim listening");

        Ok(Self {
            url,
            state,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `ws://` flavour of [`CloudSim::url`], as stored in project configs.
    pub fn ws_url(&self) -> String {
        self.url.replacen("http://", "ws://", 1)
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }
}

impl Drop for CloudSim {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
