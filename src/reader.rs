//! Background decoding of server packets into a shared answer registry.
//!
//! One [ResponseReader] task runs per open stream. It decodes packets as they
//! arrive and files their bodies under the id the server echoed. Requests
//! pick their answer up with [AnswerRegistry::consume], usually through
//! [poll_for].

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::{
    error::RconError,
    packet::{complete_packet_len, Packet, AUTH_FAILURE_ID},
};

/// Container struct for a response that can be glued together from multiple [Packet]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    id: i32,
    data: Vec<u8>,
}

impl Response {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Response { id, data }
    }

    /// The id echoed by the server.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// False if the server echoed a negative id, which is how it rejects a
    /// login.
    pub fn is_valid(&self) -> bool {
        self.id > AUTH_FAILURE_ID
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn body(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn into_body(self) -> String {
        match String::from_utf8(self.data) {
            Ok(body) => body,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

/// Bodies received so far, grouped by echoed id in arrival order.
///
/// One registry belongs to one stream. A new stream gets a new registry, so
/// a request still waiting on an old stream can never see answers meant for
/// the new one, even when ids repeat.
#[derive(Debug, Default)]
pub struct AnswerRegistry {
    answers: Mutex<Answers>,
}

#[derive(Debug, Default)]
struct Answers {
    pending: HashMap<i32, Vec<Vec<u8>>>,
    // ids nobody will consume again; later packets for them are dropped
    forgotten: HashSet<i32>,
}

impl AnswerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Answers> {
        // the map is always left consistent, a panicking holder can't hurt it
        self.answers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// File a batch of packets at once, so a waiter sees all of them or none.
    pub fn publish(&self, packets: Vec<Packet>) {
        let mut answers = self.lock();
        for packet in packets {
            if answers.forgotten.contains(&packet.id()) {
                trace!("dropping packet for forgotten id {}", packet.id());
                continue;
            }
            answers
                .pending
                .entry(packet.id())
                .or_default()
                .push(packet.into_body());
        }
    }

    /// Take every body filed under `id`, joined in the order they arrived.
    /// `None` if nothing has arrived for it yet.
    pub fn consume(&self, id: i32) -> Option<Response> {
        let parts = self.lock().pending.remove(&id)?;
        Some(Response::new(id, parts.concat()))
    }

    /// Drop whatever arrived for `id` and ignore anything that still comes.
    pub fn forget(&self, id: i32) {
        let mut answers = self.lock();
        answers.pending.remove(&id);
        answers.forgotten.insert(id);
    }

    /// Number of ids with unconsumed answers.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn wait_for(
        &self,
        id: i32,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<Response> {
        poll_for(timeout, poll_interval, || self.consume(id)).await
    }
}

/// Call `check` every `poll_interval` until it yields a response or `timeout`
/// has passed. Never returns later than `timeout` plus one interval.
pub async fn poll_for<F>(timeout: Duration, poll_interval: Duration, mut check: F) -> Option<Response>
where
    F: FnMut() -> Option<Response>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(response) = check() {
            return Some(response);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Handle to the task decoding packets from the current stream.
#[derive(Debug, Default)]
pub struct ResponseReader {
    task: Option<JoinHandle<()>>,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reading from `stream`, stopping whatever was read before.
    pub fn bind<R>(&mut self, stream: R, registry: Arc<AnswerRegistry>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.stop();
        self.task = Some(tokio::spawn(read_loop(stream, registry)));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// False once the stream ended or failed; the loop never restarts itself.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop<R>(stream: R, registry: Arc<AnswerRegistry>)
where
    R: AsyncRead + Unpin,
{
    let mut stream = BufReader::new(stream);
    loop {
        match read_batch(&mut stream).await {
            Ok(batch) => registry.publish(batch),
            Err(err) => {
                debug!("response reader stopped: {}", err);
                return;
            }
        }
    }
}

/// One packet, plus every following packet that is already fully buffered.
/// srcds splits long answers over several packets with the same id, and they
/// usually arrive together.
async fn read_batch<R>(stream: &mut BufReader<R>) -> Result<Vec<Packet>, RconError>
where
    R: AsyncRead + Unpin,
{
    let mut batch = vec![Packet::read_from(stream).await?];
    while complete_packet_len(stream.buffer()).is_some() {
        batch.push(Packet::read_from(stream).await?);
    }

    for packet in &batch {
        trace!(
            "receive packet id {} ({} bytes)",
            packet.id(),
            packet.body().len()
        );
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::packet::PacketType;

    fn response(id: i32, body: &str) -> Packet {
        Packet::new(id, PacketType::Response, body)
    }

    async fn until_stopped(reader: &ResponseReader) {
        for _ in 0..200 {
            if !reader.is_running() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("reader still running");
    }

    #[test]
    fn consume_joins_in_arrival_order() {
        let registry = AnswerRegistry::new();
        registry.publish(vec![response(4, "Available "), response(5, "other")]);
        registry.publish(vec![response(4, "commands")]);

        let answer = registry.consume(4).unwrap();
        assert_eq!(answer.id(), 4);
        assert_eq!(answer.body(), "Available commands");
        assert!(registry.consume(4).is_none());
        assert_eq!(registry.consume(5).unwrap().into_body(), "other");
        assert!(registry.is_empty());
    }

    #[test]
    fn negative_ids_are_invalid() {
        let registry = AnswerRegistry::new();
        registry.publish(vec![response(AUTH_FAILURE_ID, "")]);

        assert!(registry.consume(1).is_none());
        let answer = registry.consume(AUTH_FAILURE_ID).unwrap();
        assert!(!answer.is_valid());
        assert!(Response::new(0, vec![]).is_valid());
    }

    #[test]
    fn empty_body_still_counts_as_answer() {
        let registry = AnswerRegistry::new();
        registry.publish(vec![response(1, "")]);
        assert_eq!(registry.consume(1), Some(Response::new(1, vec![])));
    }

    #[test]
    fn forgotten_id_drops_late_packets() {
        let registry = AnswerRegistry::new();
        registry.publish(vec![response(1, "")]);
        registry.forget(1);
        registry.publish(vec![response(1, "late auth response"), response(2, "kept")]);

        assert!(registry.consume(1).is_none());
        assert_eq!(registry.consume(2).unwrap().body(), "kept");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn poll_for_gives_up_after_timeout() {
        let timeout = Duration::from_millis(50);
        let interval = Duration::from_millis(5);
        let started = Instant::now();

        let answer = poll_for(timeout, interval, || None).await;

        let elapsed = started.elapsed();
        assert!(answer.is_none());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn wait_for_picks_up_late_answer() {
        let registry = Arc::new(AnswerRegistry::new());
        let publisher = registry.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            publisher.publish(vec![response(9, "late")]);
        });

        let answer = registry
            .wait_for(9, Duration::from_secs(2), Duration::from_millis(1))
            .await;
        assert_eq!(answer.unwrap().body(), "late");
    }

    #[tokio::test]
    async fn reader_publishes_split_answer_together() {
        let (mut server, client) = duplex(4096);
        let registry = Arc::new(AnswerRegistry::new());
        let mut reader = ResponseReader::new();
        reader.bind(client, registry.clone());

        let mut bytes = response(2, "first half, ").pack();
        bytes.extend(response(2, "second half").pack());
        server.write_all(&bytes).await.unwrap();

        let answer = registry
            .wait_for(2, Duration::from_secs(2), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(answer.body(), "first half, second half");
        assert!(reader.is_running());
    }

    #[tokio::test]
    async fn reader_stops_at_end_of_stream() {
        let (server, client) = duplex(64);
        let registry = Arc::new(AnswerRegistry::new());
        let mut reader = ResponseReader::new();
        reader.bind(client, registry);
        assert!(reader.is_running());

        drop(server);
        until_stopped(&reader).await;
    }

    #[tokio::test]
    async fn rebinding_stops_previous_loop() {
        let registry = Arc::new(AnswerRegistry::new());
        let mut reader = ResponseReader::new();

        let (mut old_server, old_client) = duplex(1024);
        reader.bind(old_client, registry.clone());
        let (mut new_server, new_client) = duplex(1024);
        reader.bind(new_client, registry.clone());

        // the old client half was dropped with the aborted task
        sleep(Duration::from_millis(20)).await;
        assert!(old_server.write_all(&response(1, "stale").pack()).await.is_err());

        new_server.write_all(&response(1, "fresh").pack()).await.unwrap();
        let answer = registry
            .wait_for(1, Duration::from_secs(2), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(answer.body(), "fresh");

        reader.stop();
        assert!(!reader.is_running());
    }
}
