use conduit::core::conversation::{active_path, build_forest};
use conduit::core::message::{Message, Role};
use conduit::core::tokens::count_tokens;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// A conversation of `turns` user/assistant pairs where every fourth
/// assistant reply also has an inactive sibling branch.
fn make_conversation(turns: usize, base: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(turns * 3);
    let mut parent: Option<String> = None;
    for turn in 0..turns {
        let user = match &parent {
            Some(pid) => Message::new(pid.as_str(), Role::User, base),
            None => Message::root(Role::User, base),
        }
        .with_id(format!("u{turn}"));
        let reply = Message::new(user.id.as_str(), Role::Assistant, base).with_id(format!("a{turn}"));
        if turn % 4 == 0 {
            let mut retry =
                Message::new(user.id.as_str(), Role::Assistant, base).with_id(format!("r{turn}"));
            retry.is_active = false;
            messages.push(user);
            messages.push(retry);
        } else {
            messages.push(user);
        }
        parent = Some(reply.id.clone());
        messages.push(reply);
    }
    messages
}

fn bench_forest(c: &mut Criterion) {
    let base = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod tempor incididunt ut labore et dolore magna aliqua";

    let mut group = c.benchmark_group("conversation_forest");
    for &turns in &[100usize, 1_000usize] {
        let messages = make_conversation(turns, base);
        group.throughput(Throughput::Elements(messages.len() as u64));
        group.bench_with_input(BenchmarkId::new("build_forest", turns), &messages, |b, m| {
            b.iter(|| build_forest(m).map(|forest| forest.len()))
        });
        group.bench_with_input(BenchmarkId::new("active_path", turns), &messages, |b, m| {
            b.iter(|| active_path(m).map(|path| path.len()))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("count_tokens");
    for &repeat in &[1usize, 64usize] {
        let text = base.repeat(repeat);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("gpt-4o-mini", repeat), &text, |b, t| {
            b.iter(|| count_tokens(t, "gpt-4o-mini"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_forest);
criterion_main!(benches);
