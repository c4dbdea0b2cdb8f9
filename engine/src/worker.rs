//! Redis queue worker
//!
//! Pops jobs from `exec:queue` with BLPOP, runs each on its own task and
//! stores the outcome at `exec:result:<job_id>` (1 hour expiry), publishing
//! the same payload on `exec:results` for live subscribers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::{ExecutionRequest, ExecutionResult};
use crate::engine::Engine;
use crate::grader::GradeReport;

pub mod keys {
    /// Job queue consumed with BLPOP
    pub const JOB_QUEUE: &str = "exec:queue";

    /// Result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "exec:result:";

    /// Result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "exec:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600;
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Job received from the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum WorkerJob {
    Execute { job_id: String, request: ExecutionRequest },
    Grade { job_id: String, request: ExecutionRequest },
}

impl WorkerJob {
    pub fn job_id(&self) -> &str {
        match self {
            WorkerJob::Execute { job_id, .. } | WorkerJob::Grade { job_id, .. } => job_id,
        }
    }
}

/// Payload stored and published for a finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobOutput {
    Execute { job_id: String, result: ExecutionResult },
    /// Queue consumers are trusted backends; the report keeps operator diagnostics
    Grade { job_id: String, report: GradeReport },
}

impl JobOutput {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutput::Execute { job_id, .. } | JobOutput::Grade { job_id, .. } => job_id,
        }
    }
}

pub fn result_key(job_id: &str) -> String {
    format!("{}{}", keys::RESULT_PREFIX, job_id)
}

pub async fn process_job(engine: &Engine, job: WorkerJob) -> JobOutput {
    match job {
        WorkerJob::Execute { job_id, request } => JobOutput::Execute {
            result: engine.execute(&request).await,
            job_id,
        },
        WorkerJob::Grade { job_id, request } => JobOutput::Grade {
            report: engine.execute_with_test_cases(&request).await,
            job_id,
        },
    }
}

pub struct QueueWorker {
    client: redis::Client,
    /// Dedicated to BLPOP, which blocks the connection it runs on
    queue: MultiplexedConnection,
    results: ConnectionManager,
    engine: Arc<Engine>,
}

impl QueueWorker {
    pub async fn connect(redis_url: &str, engine: Arc<Engine>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let queue = get_connection_with_retry(&client).await;
        let results = ConnectionManager::new(client.clone())
            .await
            .context("Failed to open Redis result connection")?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            queue,
            results,
            engine,
        })
    }

    /// Consume jobs forever; each job runs on its own task
    pub async fn run(mut self) {
        info!("Waiting for jobs on {}", keys::JOB_QUEUE);
        loop {
            let job = self.pop_job().await;
            info!("Received {} job", job.job_id());

            let engine = Arc::clone(&self.engine);
            let mut results = self.results.clone();
            tokio::spawn(async move {
                let output = process_job(&engine, job).await;
                if let Err(e) = store_output(&mut results, &output).await {
                    error!("Failed to store result for job {}: {:#}", output.job_id(), e);
                }
            });
        }
    }

    /// Block until a parseable job arrives, reconnecting on failure
    async fn pop_job(&mut self) -> WorkerJob {
        loop {
            let popped: Option<(String, String)> =
                match self.queue.blpop(keys::JOB_QUEUE, 0.0).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.queue = get_connection_with_retry(&self.client).await;
                        continue;
                    }
                };

            if let Some((_, data)) = popped {
                match serde_json::from_str::<WorkerJob>(&data) {
                    Ok(job) => return job,
                    Err(e) => warn!("Failed to parse job data: {}. Data: {}", e, data),
                }
            }
        }
    }
}

async fn store_output(conn: &mut ConnectionManager, output: &JobOutput) -> Result<()> {
    let json = serde_json::to_string(output)?;

    conn.set_ex::<_, _, ()>(result_key(output.job_id()), &json, RESULT_EXPIRY_SECS)
        .await
        .context("SET EX failed")?;

    // no subscribers is not an error
    if let Err(e) = conn.publish::<_, _, ()>(keys::RESULT_CHANNEL, &json).await {
        warn!("Failed to publish result for job {}: {}", output.job_id(), e);
    }
    Ok(())
}

async fn get_connection_with_retry(client: &redis::Client) -> MultiplexedConnection {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
