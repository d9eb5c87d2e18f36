use std::time::Duration;

use tokio::time::sleep;

use super::*;

#[tokio::test]
async fn test_inbound_queue_preserves_order() {
    let q = InboundQueue::new(8);
    q.push(vec![1]).await;
    q.push(vec![2]).await;
    q.push(vec![3]).await;

    assert_eq!(q.pop(None).await, Ok(vec![1]));
    assert_eq!(q.pop(None).await, Ok(vec![2]));
    assert_eq!(q.pop(None).await, Ok(vec![3]));
    assert_eq!(q.dropped(), 0);
}

#[tokio::test]
async fn test_inbound_queue_overflow_drops_oldest() {
    let q = InboundQueue::new(3);
    for i in 0..5u8 {
        q.push(vec![i]).await;
    }

    assert_eq!(q.dropped(), 2);
    assert_eq!(q.pop(None).await, Ok(vec![2]));
    assert_eq!(q.pop(None).await, Ok(vec![3]));
    assert_eq!(q.pop(None).await, Ok(vec![4]));
}

#[tokio::test]
async fn test_inbound_queue_deadline_fires() {
    let q = InboundQueue::new(3);
    let started = Instant::now();
    let deadline = started + Duration::from_millis(50);

    assert_eq!(q.pop(Some(deadline)).await, Err(Error::ErrTimeout));
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn test_inbound_queue_expired_deadline_prefers_queued_data() {
    let q = InboundQueue::new(3);
    q.push(vec![9]).await;

    let expired = Instant::now() - Duration::from_millis(1);
    assert_eq!(q.pop(Some(expired)).await, Ok(vec![9]));
    assert_eq!(q.pop(Some(expired)).await, Err(Error::ErrTimeout));
}

#[tokio::test]
async fn test_inbound_queue_close_wakes_reader() {
    let q = Arc::new(InboundQueue::new(3));
    let reader = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.pop(None).await })
    };

    sleep(Duration::from_millis(20)).await;
    q.close(CloseReason::Closed).await;

    assert_eq!(reader.await.expect("join"), Err(Error::ErrClosed));
}

#[tokio::test]
async fn test_inbound_queue_push_after_close_is_dropped() {
    let q = InboundQueue::new(3);
    q.close(CloseReason::ConnectionLost).await;
    q.push(vec![1]).await;

    assert_eq!(q.pop(None).await, Err(Error::ErrConnectionLost));
}
