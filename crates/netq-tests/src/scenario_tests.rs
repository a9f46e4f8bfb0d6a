//! End-to-end remoting scenarios over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use netq_remoting::config::ClientConfig;
use netq_remoting::connection::ChannelEventListener;
use netq_remoting::{response_code, Channel, Command, RemotingError, RemotingServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::harness::{
    counting_processor, delayed_echo, echo_processor, init_tracing, local_server_config, start_pair,
    wait_until, TaggingHook,
};

mod sync_call_tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_before_deadline_returns_response() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(50)), None);
        })
        .await
        .unwrap();

        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(1, b"ping".to_vec()), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response.code, response_code::SUCCESS);
        assert_eq!(&response.body[..], b"ping");
        assert!(pair.client.engine().responses().is_empty());
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_reply_times_out_and_is_discarded() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(500)), None);
        })
        .await
        .unwrap();

        let err = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(1, Bytes::new()), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RemotingError::Timeout { .. }), "got {err:?}");
        assert!(pair.client.engine().responses().is_empty());

        let client = &pair.client;
        assert!(wait_until(Duration::from_secs(2), || client.metrics().responses_discarded == 1).await);
        assert_eq!(client.metrics().timeouts, 1);
        assert_eq!(client.metrics().responses_received, 0);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_match_their_responses() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, echo_processor(), None);
        })
        .await
        .unwrap();
        let addr = pair.addr();

        let calls = (0..64u32).map(|i| {
            let client = &pair.client;
            let addr = addr.clone();
            async move {
                let body = i.to_be_bytes().to_vec();
                let response = client
                    .invoke_sync(&addr, Command::request(1, body.clone()), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(&response.body[..], &body[..]);
            }
        });
        futures::future::join_all(calls).await;
        assert!(pair.client.engine().responses().is_empty());
        pair.shutdown().await;
    }
}

mod async_call_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_call_without_permit_is_busy() {
        let client_config = ClientConfig {
            permits_async: 1,
            ..ClientConfig::default()
        };
        let pair = start_pair(local_server_config(), client_config, |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(300)), None);
        })
        .await
        .unwrap();
        let addr = pair.addr();

        let (tx, rx) = tokio::sync::oneshot::channel();
        pair.client
            .invoke_async(&addr, Command::request(1, b"first".to_vec()), Duration::from_secs(2), move |r| {
                let _ = tx.send(r);
            })
            .await
            .unwrap();

        let started = Instant::now();
        let err = pair
            .client
            .invoke_async(&addr, Command::request(1, Bytes::new()), Duration::from_secs(2), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RemotingError::SystemBusy { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));

        let first = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
        assert_eq!(&first.body[..], b"first");
        assert!(wait_until(Duration::from_secs(1), || pair.client.engine().available_async_permits() == 1).await);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_runs_on_scheduler_thread() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, echo_processor(), None);
        })
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        pair.client
            .invoke_async(&pair.addr(), Command::request(1, Bytes::new()), Duration::from_secs(2), move |r| {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send((r.is_ok(), name));
            })
            .await
            .unwrap();

        let (ok, name) = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(ok);
        assert!(name.unwrap_or_default().starts_with("netq-client-callback-"));
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_async_timeout_delivered_by_sweep() {
        let mut client_config = ClientConfig::default();
        client_config.scan_interval_ms = 20;
        let pair = start_pair(local_server_config(), client_config, |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(400)), None);
        })
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        pair.client
            .invoke_async(&pair.addr(), Command::request(1, Bytes::new()), Duration::from_millis(50), move |r| {
                let _ = tx.send(r);
            })
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(RemotingError::Timeout { .. })));
        pair.shutdown().await;
    }
}

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_code_is_not_supported() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |_| {}).await.unwrap();

        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(42, Bytes::new()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.code, response_code::REQUEST_CODE_NOT_SUPPORTED);
        assert!(matches!(
            response.into_result(),
            Err(RemotingError::UnsupportedRequestCode { code: 42 })
        ));
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_oneway_gets_no_response() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |_| {}).await.unwrap();

        pair.client
            .invoke_oneway(&pair.addr(), Command::request(42, Bytes::new()), Duration::from_secs(1))
            .await
            .unwrap();

        let server = &pair.server;
        assert!(wait_until(Duration::from_secs(2), || server.metrics().unsupported_codes == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.metrics().responses_sent, 0);
        assert_eq!(pair.client.metrics().responses_discarded, 0);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_processor_serves_unmapped_codes() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_default_processor(echo_processor(), None);
        })
        .await
        .unwrap();

        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(777, b"any".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.code, response_code::SUCCESS);
        assert_eq!(&response.body[..], b"any");
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_oneway_result_is_discarded() {
        let hits = Arc::new(AtomicUsize::new(0));
        let processor_hits = Arc::clone(&hits);
        let pair = start_pair(local_server_config(), ClientConfig::default(), move |server| {
            server.register_processor(9, counting_processor(processor_hits), None);
        })
        .await
        .unwrap();

        pair.client
            .invoke_oneway(&pair.addr(), Command::request(9, Bytes::new()), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(pair.client.engine().responses().is_empty());

        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pair.server.metrics().responses_sent, 0);
        assert_eq!(pair.client.metrics().responses_discarded, 0);
        assert_eq!(pair.client.metrics().oneway_sent, 1);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_dedicated_scheduler_runs_processor() {
        let scheduler = Arc::new(netq_remoting::ElasticScheduler::new(
            netq_remoting::SchedulerConfig::fixed(1).with_name_prefix("orders-"),
        ));
        let processor_scheduler = Arc::clone(&scheduler);
        let pair = start_pair(local_server_config(), ClientConfig::default(), move |server| {
            server.register_processor(
                3,
                Arc::new(|_: &Channel, _: Command| -> netq_remoting::Result<Option<Command>> {
                    let name = std::thread::current().name().unwrap_or_default().to_string();
                    Ok(Some(Command::response(response_code::SUCCESS, name.into_bytes())))
                }),
                Some(processor_scheduler),
            );
        })
        .await
        .unwrap();

        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(3, Bytes::new()), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&response.body).starts_with("orders-"));
        pair.shutdown().await;
        scheduler.dispose();
    }

    #[tokio::test]
    async fn test_hooks_tag_requests_and_observe_responses() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(
                4,
                Arc::new(|_: &Channel, request: Command| -> netq_remoting::Result<Option<Command>> {
                    let tag = request.headers.get("x-trace").cloned().unwrap_or_default();
                    Ok(Some(Command::response(response_code::SUCCESS, tag.into_bytes())))
                }),
                None,
            );
        })
        .await
        .unwrap();

        let hook = Arc::new(TaggingHook::default());
        pair.client.register_rpc_hook(hook.clone());
        pair.client.register_rpc_hook(hook.clone());

        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(4, Bytes::new()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"harness");
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 1);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_calls_back_into_client() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, echo_processor(), None);
        })
        .await
        .unwrap();
        pair.client.register_processor(50, echo_processor(), None);

        // any call establishes the channel
        pair.client
            .invoke_sync(&pair.addr(), Command::request(1, Bytes::new()), Duration::from_secs(2))
            .await
            .unwrap();
        let server = &pair.server;
        assert!(wait_until(Duration::from_secs(1), || server.channels().len() == 1).await);
        let channel = server.channels().remove(0);

        let response = server
            .invoke_sync(&channel, Command::request(50, b"back".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"back");
        pair.shutdown().await;
    }
}

mod connection_tests {
    use super::*;
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct CountingListener {
        connects: AtomicUsize,
        closes: AtomicUsize,
        exceptions: AtomicUsize,
    }

    impl ChannelEventListener for CountingListener {
        fn on_connect(&self, _channel: &Channel) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _channel: &Channel) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exception(&self, _channel: &Channel, _reason: &str) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_decode_error_closes_only_offending_connection() {
        init_tracing();
        let listener = Arc::new(CountingListener::default());
        let server = RemotingServer::with_listener(local_server_config(), listener.clone()).unwrap();
        server.register_processor(1, echo_processor(), None);
        let addr = server.start().await.unwrap();

        let client = netq_remoting::RemotingClient::new(ClientConfig::default()).unwrap();
        client.start().unwrap();
        client
            .invoke_sync(&addr.to_string(), Command::request(1, Bytes::new()), Duration::from_secs(2))
            .await
            .unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[0, 0, 0, 3, 0xde, 0xad, 0xbe]).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "server should close the bad connection");

        assert!(wait_until(Duration::from_secs(2), || listener.exceptions.load(Ordering::SeqCst) == 1).await);
        let response = client
            .invoke_sync(&addr.to_string(), Command::request(1, b"still".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"still");
        assert!(wait_until(Duration::from_secs(2), || server.channels().len() == 1).await);

        client.shutdown().await;
        server.shutdown().await;
        assert_eq!(listener.connects.load(Ordering::SeqCst), 2);
        assert_eq!(listener.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_sync_call() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(800)), None);
        })
        .await
        .unwrap();
        let addr = pair.addr();
        pair.client.channel(&addr).await.unwrap();

        let started = Instant::now();
        let (result, ()) = tokio::join!(
            pair.client.invoke_sync(&addr, Command::request(1, Bytes::new()), Duration::from_secs(5)),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                pair.client.close_channel(&addr);
            }
        );
        assert!(matches!(result, Err(RemotingError::Cancelled { .. })), "got {result:?}");
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(pair.client.metrics().cancelled, 1);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_inflight_request() {
        let pair = start_pair(local_server_config(), ClientConfig::default(), |server| {
            server.register_processor(1, delayed_echo(Duration::from_millis(200)), None);
        })
        .await
        .unwrap();
        let addr = pair.addr();
        pair.client.channel(&addr).await.unwrap();

        let (result, ()) = tokio::join!(
            pair.client.invoke_sync(&addr, Command::request(1, b"drained".to_vec()), Duration::from_secs(2)),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pair.server.shutdown().await;
            }
        );
        assert_eq!(&result.unwrap().body[..], b"drained");
        pair.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversize_request_closes_server_channel() {
        let mut server_config = local_server_config();
        server_config.max_frame_length = 1024;
        let pair = start_pair(server_config, ClientConfig::default(), |server| {
            server.register_processor(1, echo_processor(), None);
        })
        .await
        .unwrap();
        let addr = pair.addr();

        let small = pair
            .client
            .invoke_sync(&addr, Command::request(1, b"fits".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&small.body[..], b"fits");
        let channel = pair.client.channel(&addr).await.unwrap();

        let result = pair
            .client
            .invoke_sync(&addr, Command::request(1, vec![0u8; 4096]), Duration::from_secs(2))
            .await;
        assert!(result.is_err(), "got {result:?}");
        assert!(wait_until(Duration::from_secs(2), || !channel.is_active()).await);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_close_policy_drops_connection() {
        let mut server_config = local_server_config();
        server_config.all_idle_time_ms = 100;
        server_config.idle_policy = netq_remoting::IdlePolicy::Close;
        let pair = start_pair(server_config, ClientConfig::default(), |server| {
            server.register_processor(1, echo_processor(), None);
        })
        .await
        .unwrap();
        let channel = pair.client.channel(&pair.addr()).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || !channel.is_active()).await);
        assert!(pair.server.metrics().idle_events >= 1);

        // the next call dials a fresh channel
        let response = pair
            .client
            .invoke_sync(&pair.addr(), Command::request(1, b"again".to_vec()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"again");
        pair.shutdown().await;
    }
}
