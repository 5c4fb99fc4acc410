mod common;

use std::time::Duration;

use bytes::Bytes;
use busmux::{MemoryBus, Multiplexer, StatusCode};
use common::eventually;

async fn connected() -> (MemoryBus, Multiplexer) {
    let bus = MemoryBus::new();
    let mux = Multiplexer::new(bus.connector());
    mux.wait_connected().await.unwrap();
    (bus, mux)
}

/// Тест проверяет сценарий запрос/ответ: promise разрешается первым
/// сообщением, опубликованным в канал `prefix + suffix`.
#[tokio::test(start_paused = true)]
async fn test_promise_resolves_with_published_payload() {
    let (bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("hello-").unwrap();
    promises.wait_for_activation().await.unwrap();
    assert!(promises.is_active());
    assert_eq!(mux.registered_patterns(), vec![Bytes::from_static(b"hello-*")]);

    let reply = promises
        .new_promise("world", Duration::from_secs(10))
        .unwrap();
    assert_eq!(reply.channel(), &Bytes::from_static(b"hello-world"));
    assert_eq!(bus.publish("hello-world", "success!"), 1);
    assert_eq!(reply.await.unwrap(), Bytes::from_static(b"success!"));
    assert_eq!(promises.pending_channels(), 0);
}

/// Тест проверяет отказ в создании promise до активации подписки.
#[tokio::test(start_paused = true)]
async fn test_promise_before_activation_is_rejected() {
    let bus = MemoryBus::new();
    bus.set_reachable(false);
    let mux = Multiplexer::new(bus.connector());
    let promises = mux.new_promise_subscription("hello-").unwrap();

    let err = promises
        .new_promise("world", Duration::from_secs(1))
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::InactiveSubscription);
    assert!(err.to_string().contains("hello-"));

    bus.set_reachable(true);
    let promise = promises
        .wait_for_new_promise("world", Duration::from_secs(1))
        .await
        .unwrap();
    bus.publish("hello-world", "late");
    assert_eq!(promise.await.unwrap(), Bytes::from_static(b"late"));
}

/// Тест проверяет, что одно сообщение разрешает все ожидания канала, а
/// ожидания других каналов остаются.
#[tokio::test(start_paused = true)]
async fn test_promise_fan_out_to_all_waiters() {
    let (bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("job-").unwrap();
    promises.wait_for_activation().await.unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| promises.new_promise("7", Duration::from_secs(10)).unwrap())
        .collect();
    let other = promises.new_promise("8", Duration::from_secs(10)).unwrap();
    assert_eq!(promises.pending_channels(), 2);

    bus.publish("job-7", "done");
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Bytes::from_static(b"done"));
    }
    assert_eq!(promises.pending_channels(), 1);

    bus.publish("job-8", "done too");
    assert_eq!(other.await.unwrap(), Bytes::from_static(b"done too"));
    assert_eq!(promises.pending_channels(), 0);
}

/// Тест проверяет, что повторяющиеся таймауты не накапливают записи.
#[tokio::test(start_paused = true)]
async fn test_timeouts_do_not_leak() {
    let (_bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("t-").unwrap();
    promises.wait_for_activation().await.unwrap();

    for i in 0..100 {
        let promise = promises
            .new_promise(format!("{}", i % 5), Duration::from_millis(20))
            .unwrap();
        let err = promise.await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Timeout);
        assert_eq!(promises.pending_channels(), 0);
    }
    assert_eq!(mux.registered_patterns(), vec![Bytes::from_static(b"t-*")]);
}

/// Тест проверяет отмену и сброс promise: сообщение после отмены никого
/// не разрешает, записи удаляются.
#[tokio::test(start_paused = true)]
async fn test_cancel_and_drop_clean_up() {
    let (bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("c-").unwrap();
    promises.wait_for_activation().await.unwrap();

    let cancelled = promises.new_promise("x", Duration::from_secs(10)).unwrap();
    let dropped = promises.new_promise("x", Duration::from_secs(10)).unwrap();
    let kept = promises.new_promise("x", Duration::from_secs(10)).unwrap();

    cancelled.cancel();
    drop(dropped);
    assert_eq!(promises.pending_channels(), 1);

    bus.publish("c-x", "only one");
    assert_eq!(kept.await.unwrap(), Bytes::from_static(b"only one"));
    assert_eq!(promises.pending_channels(), 0);
}

/// Тест проверяет, что разрыв соединения завершает все N ожиданий ошибкой
/// разрыва, после чего подписка снова становится активной.
#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_waiters_then_recovers() {
    let (bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("r-").unwrap();
    promises.wait_for_activation().await.unwrap();

    let waiters: Vec<_> = (0..5)
        .map(|i| {
            promises
                .new_promise(format!("{i}"), Duration::from_secs(60))
                .unwrap()
        })
        .collect();
    bus.disconnect_all();

    for waiter in waiters {
        let err = waiter.await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Disconnected);
        assert!(err.to_string().contains("interrupted by disconnect"));
    }
    assert_eq!(promises.pending_channels(), 0);

    let promise = promises
        .wait_for_new_promise("again", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(promises.is_active());
    eventually(|| !mux.active_patterns().is_empty()).await;
    bus.publish("r-again", "back");
    assert_eq!(promise.await.unwrap(), Bytes::from_static(b"back"));
}

/// Тест проверяет закрытие подписки: ожидания завершаются, шаблон снимается
/// с шины, последующие вызовы запрещены.
#[tokio::test(start_paused = true)]
async fn test_close_fails_waiters_and_unsubscribes() {
    let (bus, mux) = connected().await;
    let promises = mux.new_promise_subscription("z-").unwrap();
    promises.wait_for_activation().await.unwrap();

    let waiter = promises.new_promise("1", Duration::from_secs(60)).unwrap();
    promises.close().unwrap();
    assert_eq!(
        waiter.await.unwrap_err().status_code(),
        StatusCode::SubscriptionClosed
    );
    eventually(|| bus.command_count("PUNSUBSCRIBE", "z-*") == 1).await;

    assert!(promises.is_closed());
    assert_eq!(
        promises
            .new_promise("2", Duration::from_secs(1))
            .unwrap_err()
            .status_code(),
        StatusCode::SubscriptionClosed
    );
    assert!(promises.wait_for_activation().await.is_err());
    assert!(promises.close().is_err());
}
