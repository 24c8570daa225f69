use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::thread::JoinHandle;

use image::RgbImage;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{Detection, Detector};
use crate::error::{Error, Result};

struct Job {
	image: RgbImage,
	reply: oneshot::Sender<Result<Vec<Detection>>>,
}

/// Owns the inference thread. Dropping the worker stops the thread once the
/// job in flight (if any) completes; on a tokio runtime the drop itself
/// returns without waiting for it.
pub struct InferenceWorker {
	jobs: Option<mpsc::Sender<Job>>,
	thread: Option<JoinHandle<()>>,
}

impl InferenceWorker {
	pub fn spawn(mut detector: Box<dyn Detector>) -> Result<Self> {
		let (jobs, queue) = mpsc::channel::<Job>();
		let name = detector.name().to_string();
		let thread = std::thread::Builder::new().name("trap-inference".into()).spawn(move || {
			debug!(target: "trap.inference", detector = %name, "inference thread started");
			while let Ok(job) = queue.recv() {
				let result = match std::panic::catch_unwind(AssertUnwindSafe(|| detector.infer(&job.image))) {
					Ok(result) => result,
					Err(_) => {
						error!(target: "trap.inference", detector = %name, "detector panicked");
						Err(Error::Inference(format!("detector {name} panicked")))
					}
				};
				let _ = job.reply.send(result);
			}
			debug!(target: "trap.inference", detector = %name, "inference thread stopped");
		})?;

		Ok(Self {
			jobs: Some(jobs),
			thread: Some(thread),
		})
	}

	/// Runs the detector on `image` and waits for its result.
	pub async fn infer(&self, image: RgbImage) -> Result<Vec<Detection>> {
		let (reply, result) = oneshot::channel();
		self.jobs
			.as_ref()
			.ok_or_else(|| Error::Inference("worker stopped".into()))?
			.send(Job { image, reply })
			.map_err(|_| Error::Inference("inference thread is gone".into()))?;
		result.await.map_err(|_| Error::Inference("inference thread dropped the job".into()))?
	}
}

impl Drop for InferenceWorker {
	fn drop(&mut self) {
		self.jobs.take();
		let Some(thread) = self.thread.take() else {
			return;
		};
		// Inside the runtime the join must not hold a worker thread while a
		// slow inference finishes.
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				runtime.spawn_blocking(move || {
					let _ = thread.join();
				});
			}
			Err(_) => {
				let _ = thread.join();
			}
		}
	}
}
