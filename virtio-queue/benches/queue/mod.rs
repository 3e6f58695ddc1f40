// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use criterion::{black_box, BatchSize, Criterion};
use virtio_queue::defs::VIRTQ_MAX_SIZE;
use virtio_queue::{LogThrottle, Virtq};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};

use virtio_queue::mock::MockSplitQueue;

pub fn benchmark_queue(c: &mut Criterion) {
    fn walk_queue<M: GuestMemory>(q: &mut Virtq, mem: &M) -> (usize, usize) {
        let throttle = LogThrottle::new();
        let mut num_chains = 0;
        let mut num_descriptors = 0;

        while let Ok(chain) = q.get(mem, true, usize::from(VIRTQ_MAX_SIZE), &throttle) {
            num_chains += 1;
            num_descriptors +=
                chain.readable().segments().len() + chain.writable().segments().len();
        }

        (num_chains, num_descriptors)
    }

    fn bench_queue<S, R>(c: &mut Criterion, bench_name: &str, setup: S, mut routine: R)
    where
        S: FnMut() -> Virtq + Clone,
        R: FnMut(Virtq),
    {
        c.bench_function(bench_name, move |b| {
            b.iter_batched(
                setup.clone(),
                |q| routine(black_box(q)),
                BatchSize::SmallInput,
            )
        });
    }

    let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0x0), 0x1_0000_0000)]).unwrap();

    let queue_with_chains = |num_chains: u16, len: u16| {
        let mq = MockSplitQueue::new(&mem, 256);
        for i in 0..num_chains {
            mq.add_chain(i * len, len);
        }
        mq.create_queue()
    };

    let empty_queue = || {
        let mq = MockSplitQueue::new(&mem, 256);
        mq.create_queue()
    };

    bench_queue(
        c,
        "single chain",
        || queue_with_chains(1, 128),
        |mut q| {
            let (num_chains, num_descriptors) = walk_queue(&mut q, &mem);
            assert_eq!(num_chains, 1);
            assert_eq!(num_descriptors, 128);
        },
    );

    bench_queue(
        c,
        "multiple chains",
        || queue_with_chains(128, 1),
        |mut q| {
            let (num_chains, num_descriptors) = walk_queue(&mut q, &mem);
            assert_eq!(num_chains, 128);
            assert_eq!(num_descriptors, 128);
        },
    );

    bench_queue(c, "put and publish", empty_queue, |mut q| {
        let mq = MockSplitQueue::new(&mem, 256);
        let throttle = LogThrottle::new();
        for _ in 0..128 {
            mq.add_chain(0, 1);
        }
        let response = [0u8; 64];
        while let Ok(chain) = q.get(&mem, true, 256, &throttle) {
            q.put(&mem, chain, &response, false).unwrap();
        }
        q.publish_used(&mem).unwrap();
    });
}
