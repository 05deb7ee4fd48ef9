use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nara_gc::{Collector, Handle, Trace, Visitor};

#[derive(Debug)]
struct Node {
    next: Option<Handle>,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        if let Some(next) = self.next {
            visitor.visit(next);
        }
    }
}

fn bench_alloc_release(c: &mut Criterion) {
    c.bench_function("alloc_release_leaf", |b| {
        let mut gc = Collector::new();
        b.iter(|| {
            let h = gc.alloc(Node { next: None }).unwrap();
            gc.lock(black_box(h));
            gc.unlock(h);
            gc.step();
        });
    });
}

fn bench_ring_reclaim(c: &mut Criterion) {
    c.bench_function("reclaim_ring_64", |b| {
        b.iter(|| {
            let mut gc = Collector::new();
            let nodes: Vec<Handle> = (0..64)
                .map(|_| gc.alloc(Node { next: None }).unwrap())
                .collect();
            for (i, &node) in nodes.iter().enumerate() {
                let next = nodes[(i + 1) % nodes.len()];
                gc.get_mut(node).next = Some(next);
                gc.advise_new_link(next);
            }
            gc.lock(nodes[0]);
            gc.unlock(nodes[0]);
            gc.run_to_quiescence();
            black_box(gc.stats().total_freed)
        });
    });
}

criterion_group!(benches, bench_alloc_release, bench_ring_reclaim);
criterion_main!(benches);
