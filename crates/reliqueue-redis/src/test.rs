use crate::{RedisQueue, RedisQueueConfig};
use reliqueue_core::Queue;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Spawns a throwaway local `redis-server` for the adapter tests,
/// following `mod_redis::test::RedisServer`'s approach of feeding it
/// minimal config over stdin and waiting for its ready line.
struct RedisServer {
    _daemon: Child,
    port: u16,
    _dir: TempDir,
}

fn allocate_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind 127.0.0.1:0 failed");
    listener.local_addr().unwrap().port()
}

impl RedisServer {
    async fn spawn() -> anyhow::Result<Self> {
        let port = allocate_port();
        let dir = tempfile::tempdir()?;
        let mut daemon = Command::new("redis-server")
            .args(["-"])
            .stdin(Stdio::piped())
            .stderr(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = BufReader::new(daemon.stdout.take().unwrap());

        if let Some(mut stdin) = daemon.stdin.take() {
            stdin.write_all(b"bind 127.0.0.1\nlogfile /dev/stdout\n").await?;
            stdin.write_all(format!("port {port}\n").as_bytes()).await?;
            stdin
                .write_all(format!("dir {}\n", dir.path().display()).as_bytes())
                .await?;
            drop(stdin);
        }

        loop {
            let mut line = String::new();
            stdout.read_line(&mut line).await?;
            if line.is_empty() {
                anyhow::bail!("redis-server exited before becoming ready");
            }
            if line.contains("Server initialized") || line.contains("ready to accept connections")
            {
                break;
            }
        }

        Ok(Self {
            _daemon: daemon,
            port,
            _dir: dir,
        })
    }

    fn node(&self) -> String {
        format!("redis://127.0.0.1:{}/", self.port)
    }
}

async fn open() -> Option<(RedisServer, RedisQueue)> {
    open_with(true, Default::default()).await
}

async fn open_with(
    fifo: bool,
    ephemeral: crate::EphemeralConfig,
) -> Option<(RedisServer, RedisQueue)> {
    if which::which("redis-server").is_err() {
        eprintln!("skipping redis adapter test: redis-server not on PATH");
        return None;
    }
    let server = timeout(Duration::from_secs(5), RedisServer::spawn())
        .await
        .expect("spawn timed out")
        .expect("spawn failed");
    let queue = RedisQueue::open(&RedisQueueConfig {
        node: server.node(),
        fifo,
        redis_hash_name: "test_h".into(),
        redis_list_name: "test_l".into(),
        redis_sorted_set_name: "test_s".into(),
        pool_size: None,
        connect_timeout: None,
        response_timeout: None,
        ephemeral,
    })
    .unwrap();
    Some((server, queue))
}

#[tokio::test]
async fn round_trip() {
    let Some((_server, queue)) = open().await else {
        return;
    };

    queue
        .enqueue(reliqueue_core::Message::new(None, b"hello".to_vec()))
        .await
        .unwrap();
    let taken = queue.take().await.unwrap().unwrap();
    assert_eq!(taken.content, b"hello");

    queue.finalize(taken.id.as_str()).await.unwrap();
    assert_eq!(queue.ephemeral_size().await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_enqueue_is_rejected() {
    let Some((_server, queue)) = open().await else {
        return;
    };

    let msg = reliqueue_core::Message::new(None, b"x".to_vec());
    assert!(queue.enqueue(msg.clone()).await.unwrap());
    assert!(!queue.enqueue(msg).await.unwrap());
}

#[tokio::test]
async fn requeue_round_trip() {
    let Some((_server, queue)) = open().await else {
        return;
    };

    queue
        .enqueue(reliqueue_core::Message::new(None, b"r".to_vec()))
        .await
        .unwrap();
    let taken = queue.take().await.unwrap().unwrap();
    queue.requeue(taken).await.unwrap();

    assert_eq!(queue.queue_size().await.unwrap(), 1);
    let again = queue.take().await.unwrap().unwrap();
    assert_eq!(again.num_requeues, 1);
}

#[tokio::test]
async fn orphan_reclaim() {
    let Some((_server, queue)) = open().await else {
        return;
    };

    queue
        .enqueue(reliqueue_core::Message::new(None, b"o".to_vec()))
        .await
        .unwrap();
    let taken = queue.take().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let orphans = queue.orphans(10).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, taken.id);
}

#[tokio::test]
async fn lifo_ordering() {
    let Some((_server, queue)) = open_with(false, Default::default()).await else {
        return;
    };

    queue
        .enqueue(reliqueue_core::Message::new(None, b"a".to_vec()))
        .await
        .unwrap();
    queue
        .enqueue(reliqueue_core::Message::new(None, b"b".to_vec()))
        .await
        .unwrap();

    let first = queue.take().await.unwrap().unwrap();
    assert_eq!(first.content, b"b");
}

#[tokio::test]
async fn ephemeral_disabled_deletes_hash_entry() {
    let ephemeral = crate::EphemeralConfig {
        ephemeral_disabled: true,
        ephemeral_max_size: None,
    };
    let Some((server, queue)) = open_with(true, ephemeral).await else {
        return;
    };

    queue
        .enqueue(reliqueue_core::Message::new(None, b"e".to_vec()))
        .await
        .unwrap();
    let taken = queue.take().await.unwrap().unwrap();
    assert_eq!(queue.ephemeral_size().await.unwrap(), 0);

    let client = redis::Client::open(server.node()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let exists: bool = redis::cmd("HEXISTS")
        .arg("test_h")
        .arg(taken.id.as_str())
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(!exists, "hash entry should be deleted when ephemeral storage is disabled");
}
