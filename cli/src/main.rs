mod jacobi;

use std::{
    env,
    sync::{Arc, Mutex},
};

use dendrite::{
    collection::ElementContext, registry::ElementType, world, Handler, Index, MemberHandler,
    NodeId, RegistryBuilder, Runtime, RuntimeConfig,
};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

#[derive(Archive, Serialize, Deserialize, Debug, Default)]
#[archive(check_bytes)]
struct Link {
    got: Option<u64>,
}

#[derive(Clone, Copy)]
struct Demo {
    hello: Handler<String>,
    link: ElementType<Link>,
    pass: MemberHandler<Link, u64>,
    jacobi: jacobi::Handles,
}

fn register(reg: &mut RegistryBuilder) -> Demo {
    Demo {
        hello: reg.handler("demo::hello", |rt: &mut Runtime, from: NodeId, text: String| {
            info!("node {} heard {:?} from {}", rt.this_node(), text, from);
        }),
        link: reg.element_type("demo::link"),
        pass: reg.member(
            "demo::pass",
            |link: &mut Link, rt: &mut Runtime, ctx: &ElementContext, from: u64| {
                link.got = Some(from);
                info!("ring {} got {} on node {}", ctx.index, from, rt.this_node());
            },
        ),
        jacobi: jacobi::register(reg),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let nodes: NodeId = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);
    let residual = Arc::new(Mutex::new(None));
    let out = residual.clone();

    let run = world::launch(nodes, RuntimeConfig::default(), register, move |mut rt, demo| {
        let out = out.clone();
        async move {
            rt.initialize().await?;

            let hello = rt.collective_scope(|rt| {
                if rt.this_node() == 0 {
                    rt.broadcast(demo.hello, "hello".to_string());
                }
            });
            rt.wait_epoch(hello).await?;

            let len = 2 * rt.num_nodes() as u64;
            let ring = rt.make_collection(demo.link, Index::d1(len), None, |_| Link::default());
            let passed = rt.collective_scope(|rt| {
                for index in rt.local_indices(ring) {
                    let i = index.get(0);
                    rt.send_elem(ring, Index::d1((i + 1) % len), demo.pass, i);
                }
            });
            rt.wait_epoch(passed).await?;
            rt.barrier().await?;

            let grid = jacobi::make_grid(&mut rt, &demo.jacobi, 8);
            if let Some(r) = jacobi::solve(&mut rt, &demo.jacobi, grid, 40).await? {
                if let Ok(mut out) = out.lock() {
                    *out = Some(r);
                }
            }
            rt.finalize().await
        }
    });

    if let Err(e) = run.await {
        eprintln!("run failed: {}", e);
        std::process::exit(1);
    }
    if let Ok(residual) = residual.lock() {
        match *residual {
            Some(r) => println!(
                "jacobi residual after 40 sweeps: {:.3e} (sequential {:.3e})",
                r,
                jacobi::reference(8, 40)
            ),
            None => println!("no residual reported"),
        }
    };
}
