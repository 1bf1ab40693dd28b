// Sender against receiver over loopback UDP, one variant at a time.

use std::time::Duration;

use tempdir::TempDir;
use tftp_probe::config::{ClientConfig, ServerConfig};
use tftp_probe::report::{BlockRanges, Ending};
use tftp_probe::{spawn_transfer, AbortHandle, IntegrityReport, Server, SessionError, Transfer, TransferReport, Variant, Verdict};
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(30);

fn client_config() -> ClientConfig {
    ClientConfig {
        poll_interval_ms: 10,
        fault_ack_timeout_ms: 100,
        ..ClientConfig::default()
    }
}

fn server_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        bind: ([127, 0, 0, 1], 0).into(),
        output_dir: dir.path().to_path_buf(),
        receive_timeout_ms: 300,
        poll_interval_ms: 10,
        overwrite: false,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct Outcome {
    sent: Result<TransferReport, SessionError>,
    received: IntegrityReport,
    written: Vec<u8>,
}

async fn run(variant: Variant, data: Vec<u8>, client: ClientConfig) -> Outcome {
    let dir = TempDir::new("e2e").unwrap();
    let server = Server::bind(server_config(&dir)).unwrap();
    let addr = server.local_addr().unwrap();

    let receiver = tokio::spawn(async move {
        let abort = AbortHandle::new();
        let handler = server.accept(&abort).await.unwrap().unwrap();
        handler.handle(&abort).await
    });

    let sender = spawn_transfer(client, Transfer::new(addr, "payload.bin", data), variant, None);
    let sent = timeout(LIMIT, sender.join()).await.unwrap();
    let received = timeout(LIMIT, receiver).await.unwrap().unwrap();
    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();

    Outcome { sent, received, written }
}

#[tokio::test]
async fn round_trip_is_byte_exact() {
    for len in [0, 1, 511, 513, 1000, 5000] {
        let data = payload(len);
        let outcome = run(Variant::Normal, data.clone(), client_config()).await;

        let sent = outcome.sent.unwrap();
        assert_eq!(sent.bytes_sent, len as u64);
        assert_eq!(outcome.written, data, "payload of {len} bytes");
        assert_eq!(outcome.received.received_size, len as u64);
        assert!(outcome.received.missing_blocks.is_empty());
        assert_eq!(outcome.received.verdict(), Verdict::Intact);
    }
}

#[tokio::test]
async fn exact_multiples_end_with_empty_block() {
    for (len, blocks) in [(512, vec![1, 2]), (1024, vec![1, 2, 3])] {
        let data = payload(len);
        let outcome = run(Variant::Normal, data.clone(), client_config()).await;

        assert_eq!(outcome.sent.unwrap().packets_sent, blocks.len() as u64);
        assert_eq!(outcome.received.received_blocks, blocks);
        assert_eq!(outcome.received.ending, Ending::TerminalBlock);
        assert_eq!(outcome.written, data);
    }
}

#[tokio::test]
async fn truncated_transfer_is_reported_after_timeout() {
    let outcome = run(Variant::Truncated, payload(1000), client_config()).await;

    let sent = outcome.sent.unwrap();
    assert_eq!(sent.truncated_at, Some(512));
    assert_eq!(sent.bytes_sent, 512);

    let report = outcome.received;
    assert_eq!(report.received_size, 512);
    assert_eq!(report.ending, Ending::TimedOut);
    assert_eq!(report.verdict(), Verdict::SizeMismatch { expected: 1000, received: 512 });
    assert!(report.is_corrupt());
    assert_eq!(outcome.written.len(), 512);
}

#[tokio::test]
async fn packet_loss_shows_up_as_missing_blocks() {
    let client = ClientConfig { loss_seed: Some(7), ..client_config() };
    let outcome = run(Variant::PacketLoss, payload(50 * 512 + 100), client).await;

    let sent = outcome.sent.unwrap();
    let report = outcome.received;
    let dropped: BlockRanges = sent.dropped.iter().copied().collect();

    assert!(!dropped.is_empty());
    assert_eq!(report.missing_blocks, dropped);
    assert_eq!(report.received_blocks.len() as u64 + dropped.len(), 51);
    assert!(report.is_corrupt());
    assert_eq!(outcome.written.len() as u64, report.received_size);
}

#[tokio::test]
async fn out_of_order_blocks_leave_a_gap() {
    let outcome = run(Variant::OutOfOrder, payload(4 * 512 + 10), client_config()).await;

    let sent = outcome.sent.unwrap();
    assert_eq!(sent.swapped, vec![(3, 4)]);
    assert_eq!(sent.missed_acks, vec![3]);

    let report = outcome.received;
    assert_eq!(report.received_blocks, vec![1, 2, 4, 5]);
    assert_eq!(report.missing_blocks, BlockRanges::from_iter([3]));
    assert_eq!(report.duplicate_or_reordered_events, 1);
    assert_eq!(report.ending, Ending::TerminalBlock);
    assert_eq!(report.verdict(), Verdict::SizeMismatch { expected: 2058, received: 1546 });
}

#[tokio::test]
async fn duplicate_blocks_are_written_once() {
    let data = payload(6 * 512 + 1);
    let outcome = run(Variant::Duplicate, data.clone(), client_config()).await;

    let sent = outcome.sent.unwrap();
    assert_eq!(sent.duplicated, vec![5]);
    assert_eq!(sent.packets_sent, 8);
    assert_eq!(sent.missed_acks, vec![5]);

    let report = outcome.received;
    assert_eq!(report.duplicate_or_reordered_events, 1);
    assert_eq!(report.verdict(), Verdict::Intact);
    assert_eq!(outcome.written, data);
}

#[tokio::test]
async fn wrong_block_number_jumps_the_cursor_once() {
    let outcome = run(Variant::WrongBlockNumbers, payload(8 * 512 + 3), client_config()).await;

    let sent = outcome.sent.unwrap();
    assert_eq!(sent.corrupted, vec![(7, 17)]);
    assert_eq!(sent.missed_acks, vec![8, 9]);

    let report = outcome.received;
    assert_eq!(report.received_blocks, vec![1, 2, 3, 4, 5, 6, 17]);
    assert_eq!(report.missing_blocks, (7..17).collect::<BlockRanges>());
    assert_eq!(report.duplicate_or_reordered_events, 2);
    assert_eq!(report.ending, Ending::TimedOut);
    assert!(report.is_corrupt());
}

#[tokio::test]
async fn stalled_sender_is_timed_out_by_receiver() {
    let client = ClientConfig { timeout_pause_secs: 1, ..client_config() };
    let outcome = run(Variant::Timeout, payload(6 * 512), client).await;

    let sent = outcome.sent.unwrap();
    assert_eq!(sent.paused_before, Some(5));
    assert_eq!(sent.missed_acks, vec![5, 6, 7]);

    let report = outcome.received;
    assert_eq!(report.ending, Ending::TimedOut);
    assert_eq!(report.received_size, 4 * 512);
    assert_eq!(report.missing_blocks, BlockRanges::from_iter([5, 6, 7]));
    assert_eq!(report.verdict(), Verdict::SizeMismatch { expected: 6 * 512, received: 4 * 512 });
}

#[tokio::test]
async fn serve_handles_transfers_until_aborted() {
    let dir = TempDir::new("serve").unwrap();
    let server = Server::bind(server_config(&dir)).unwrap();
    let addr = server.local_addr().unwrap();
    let abort = AbortHandle::new();

    let serving = {
        let abort = abort.clone();
        tokio::spawn(async move { server.serve(&abort).await })
    };

    for name in ["one.bin", "two.bin"] {
        let data = payload(700);
        let sent = spawn_transfer(client_config(), Transfer::new(addr, name, data.clone()), Variant::Normal, None);
        timeout(LIMIT, sent.join()).await.unwrap().unwrap();

        // The final ACK goes out before the file is flushed; give the handler a moment.
        let path = dir.path().join(name);
        let mut written = Vec::new();
        for _ in 0..100 {
            written = std::fs::read(&path).unwrap_or_default();
            if written == data {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(written, data);
    }

    abort.abort();
    assert!(timeout(LIMIT, serving).await.unwrap().unwrap().is_ok());
}
