//! S5: a bounded channel of capacity 16 suspends its producer once full, and a consumer popping
//! at a steady interval observes every item in order.

use std::thread;
use std::time::Duration;

use corert::sync::channel::Channel;

#[test]
fn bounded_channel_preserves_order_under_backpressure() {
    let (tx, rx) = Channel::<u32>::bounded(16);

    let producer = thread::spawn(move || {
        futures::executor::block_on(async {
            for i in 0..1000u32 {
                tx.push(i).await.unwrap();
            }
            tx.close();
        });
    });

    let consumer = thread::spawn(move || {
        futures::executor::block_on(async {
            let mut received = Vec::with_capacity(1000);
            loop {
                thread::sleep(Duration::from_micros(200));
                match rx.pop().await {
                    Ok(v) => received.push(v),
                    Err(_) => break,
                }
            }
            received
        })
    });

    producer.join().unwrap();
    let received = consumer.join().unwrap();

    let expected: Vec<u32> = (0..1000).collect();
    assert_eq!(received, expected);
}
