//! Integration tests: frames from the shared store, cut into slices, through
//! per-slice jitter buffers and out to a reader on its own thread, the way
//! server sessions and slice controllers use them.

use std::sync::Arc;
use std::time::Duration;

use ledwall_core::{Canvas, DeviceId, FrameStore, Rgb, SliceTable, WallGeometry, jitter};

const SLICES: usize = 3;
const FRAMES: u64 = 300;

fn geometry() -> WallGeometry {
    WallGeometry::new(4, 2 * SLICES, 2).unwrap()
}

/// `r` = low byte of the sequence number, `g` = slice index.
fn stamped(geometry: WallGeometry, seq: u64) -> ledwall_core::Frame {
    let mut canvas = Canvas::new(geometry);
    for y in 0..canvas.height() {
        for x in 0..canvas.width() {
            let slice = y / geometry.slice_height;
            canvas.set(x, y, Rgb::new(seq as u8, slice as u8, 0));
        }
    }
    canvas.freeze()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_slice_buffer_sees_every_frame_in_order() {
    let geometry = geometry();
    let table = SliceTable::new(
        (0..SLICES as u8)
            .map(|n| DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x30, n]))
            .collect(),
    )
    .unwrap();
    let store = Arc::new(FrameStore::new(4));
    let start = store.open(table.len());

    let producer = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            for seq in start..start + FRAMES {
                store.push(seq, stamped(geometry, seq)).await.unwrap();
            }
        }
    });

    let mut sessions = Vec::new();
    let mut readers = Vec::new();
    for id in table.iter() {
        let slice = table.slice_index(id).unwrap();
        let (mut writer, mut reader) = jitter::channel(8, geometry.slice_len());

        // session side: pop every sequence and fill the device's buffer
        let store = Arc::clone(&store);
        sessions.push(tokio::spawn(async move {
            for seq in start..start + FRAMES {
                let frame = store.pop(seq).await.unwrap();
                let payload = frame.slice(slice).unwrap();
                while writer.is_full() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                writer.next().unwrap().copy_from_slice(&payload);
                writer.push().unwrap();
            }
        }));

        // playout side: a plain thread, like the clock context
        readers.push(std::thread::spawn(move || {
            let mut expect = start;
            while expect < start + FRAMES {
                let Some(front) = reader.front() else {
                    std::thread::yield_now();
                    continue;
                };
                for pixel in front.chunks_exact(3) {
                    assert_eq!(pixel, &[expect as u8, slice as u8, 0]);
                }
                reader.pop().unwrap();
                expect += 1;
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), producer)
        .await
        .expect("producer stalled")
        .unwrap();
    for session in sessions {
        tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("session stalled")
            .unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn reopened_cycle_starts_every_slice_on_the_same_frame() {
    let geometry = geometry();
    let store = Arc::new(FrameStore::new(4));

    let first = store.open(SLICES);
    for seq in first..first + 3 {
        store.push(seq, stamped(geometry, seq)).await.unwrap();
    }
    // one slice drops out mid-cycle
    store.close();
    assert!(store.is_empty());

    let restart = store.open(SLICES);
    assert_eq!(restart, first + 3);
    store.push(restart, stamped(geometry, restart)).await.unwrap();
    for slice in 0..SLICES {
        let frame = store.pop(restart).await.unwrap();
        let payload = frame.slice(slice).unwrap();
        assert_eq!(&payload[..3], &[restart as u8, slice as u8, 0]);
    }
    assert!(store.is_empty());
}
