//! Jacobi relaxation of Laplace's equation, one grid point per element.
//!
//! Each iteration is a task round of two steps per point: `publish` sends the
//! point's value to its four neighbours, and `update` (which depends on the
//! neighbours' and its own publish) averages the received values. The top
//! edge is held at 1, the other edges at 0.

use std::sync::{Arc, Mutex};

use dendrite::{
    collection::ElementContext,
    registry::{ops, ElementType},
    CollectionProxy, Error, Index, MemberHandler, ReduceOp, RegistryBuilder, Runtime,
};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

const UP: usize = 0;
const DOWN: usize = 1;
const LEFT: usize = 2;
const RIGHT: usize = 3;

#[derive(Archive, Serialize, Deserialize, Debug, Default)]
#[archive(check_bytes)]
pub struct Point {
    value: f64,
    /// Latest neighbour values by direction; boundary values where there is
    /// no neighbour.
    ghosts: [f64; 4],
    residual: f64,
}

impl Point {
    fn new(index: &Index) -> Self {
        let mut ghosts = [0.0; 4];
        if index.get(0) == 0 {
            ghosts[UP] = 1.0;
        }
        Self {
            value: 0.0,
            ghosts,
            residual: 0.0,
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub struct Ghost {
    dir: u8,
    value: f64,
}

#[derive(Clone, Copy)]
pub struct Handles {
    point: ElementType<Point>,
    publish: MemberHandler<Point, u8>,
    update: MemberHandler<Point, u8>,
    max: ReduceOp<f64>,
}

/// The in-grid neighbours of `index`, each with the direction it lies in.
fn neighbours(index: &Index, n: u64) -> Vec<(usize, Index)> {
    let (i, j) = (index.get(0), index.get(1));
    let mut out = Vec::with_capacity(4);
    if i > 0 {
        out.push((UP, Index::d2(i - 1, j)));
    }
    if i + 1 < n {
        out.push((DOWN, Index::d2(i + 1, j)));
    }
    if j > 0 {
        out.push((LEFT, Index::d2(i, j - 1)));
    }
    if j + 1 < n {
        out.push((RIGHT, Index::d2(i, j + 1)));
    }
    out
}

pub fn register(reg: &mut RegistryBuilder) -> Handles {
    let point = reg.element_type("jacobi::point");
    let ghost = reg.member(
        "jacobi::ghost",
        |p: &mut Point, _: &mut Runtime, _: &ElementContext, g: Ghost| {
            p.ghosts[g.dir as usize] = g.value;
        },
    );
    let publish = reg.member(
        "jacobi::publish",
        move |p: &mut Point, rt: &mut Runtime, ctx: &ElementContext, _: u8| {
            let n = rt.collection_bounds(ctx.proxy).get(0);
            for (dir, next) in neighbours(&ctx.index, n) {
                // the neighbour sees this point from the opposite side
                let dir = (dir ^ 1) as u8;
                rt.send_elem(ctx.proxy, next, ghost, Ghost { dir, value: p.value });
            }
        },
    );
    let update = reg.member(
        "jacobi::update",
        |p: &mut Point, _: &mut Runtime, _: &ElementContext, _: u8| {
            let next = 0.25 * (p.ghosts[UP] + p.ghosts[DOWN] + p.ghosts[LEFT] + p.ghosts[RIGHT]);
            p.residual = (next - p.value).abs();
            p.value = next;
        },
    );
    let max = reg.reduce_op("jacobi::max", ops::max::<f64>);
    Handles {
        point,
        publish,
        update,
        max,
    }
}

/// Creates an `n` by `n` grid. Collective.
pub fn make_grid(rt: &mut Runtime, h: &Handles, n: u64) -> CollectionProxy {
    rt.make_collection(h.point, Index::d2(n, n), None, Point::new)
}

/// Runs `iterations` sweeps and returns the largest change of the last one
/// on node 0. Collective.
pub async fn solve(
    rt: &mut Runtime,
    h: &Handles,
    grid: CollectionProxy,
    iterations: usize,
) -> Result<Option<f64>, Error> {
    let n = rt.collection_bounds(grid).get(0);
    let h = *h;
    for iteration in 0..iterations {
        rt.start_tasks();
        let publish = rt.task_collective(grid, |rt, index, _| {
            rt.send_elem(grid, *index, h.publish, 0);
        });
        rt.task_collective(grid, |rt, index, task| {
            task.depends_on(*index, publish);
            for (_, next) in neighbours(index, n) {
                task.depends_on(next, publish);
            }
            rt.send_elem(grid, *index, h.update, 0);
        });
        rt.phase_done().await?;
        if iteration % 10 == 9 {
            info!("sweep {} done on node {}", iteration + 1, rt.this_node());
        }
    }

    let result = Arc::new(Mutex::new(None));
    let out = result.clone();
    let epoch = rt.collective_scope(|rt| {
        rt.reduce_collection(
            grid,
            0,
            h.max,
            |_, p: &mut Point| p.residual,
            move |_, residual| {
                if let Ok(mut out) = out.lock() {
                    *out = Some(residual);
                }
            },
        );
    });
    rt.wait_epoch(epoch).await?;
    let residual = result.lock().ok().and_then(|r| *r);
    Ok(residual)
}

/// The same sweeps done sequentially, for checking.
pub fn reference(n: usize, iterations: usize) -> f64 {
    let at = |grid: &[f64], i: isize, j: isize| -> f64 {
        if i < 0 {
            1.0
        } else if i >= n as isize || j < 0 || j >= n as isize {
            0.0
        } else {
            grid[i as usize * n + j as usize]
        }
    };
    let mut grid = vec![0.0; n * n];
    let mut residual = 0.0;
    for _ in 0..iterations {
        let mut next = vec![0.0; n * n];
        residual = 0.0f64;
        for i in 0..n as isize {
            for j in 0..n as isize {
                let v = 0.25
                    * (at(&grid, i - 1, j)
                        + at(&grid, i + 1, j)
                        + at(&grid, i, j - 1)
                        + at(&grid, i, j + 1));
                let k = i as usize * n + j as usize;
                residual = residual.max((v - grid[k]).abs());
                next[k] = v;
            }
        }
        grid = next;
    }
    residual
}

#[cfg(test)]
mod tests {
    use dendrite::{world, RuntimeConfig};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn matches_the_sequential_sweeps() {
        world::init_test_tracing();
        let found = Arc::new(Mutex::new(None));
        let out = found.clone();
        world::launch(4, RuntimeConfig::default(), register, move |mut rt, h| {
            let out = out.clone();
            async move {
                rt.initialize().await?;
                let grid = make_grid(&mut rt, &h, 6);
                if let Some(residual) = solve(&mut rt, &h, grid, 12).await? {
                    *out.lock().unwrap() = Some(residual);
                }
                rt.finalize().await
            }
        })
        .await
        .unwrap();
        let residual = found.lock().unwrap().expect("root saw no residual");
        let expected = reference(6, 12);
        assert!((residual - expected).abs() < 1e-12, "{} vs {}", residual, expected);
        assert!(residual > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_moved_point_keeps_converging() {
        world::init_test_tracing();
        let found = Arc::new(Mutex::new(None));
        let out = found.clone();
        world::launch(3, RuntimeConfig::default(), register, move |mut rt, h| {
            let out = out.clone();
            async move {
                rt.initialize().await?;
                let grid = make_grid(&mut rt, &h, 4);
                solve(&mut rt, &h, grid, 3).await?;
                let moved = rt.collective_scope(|rt| {
                    if rt.local_indices(grid).contains(&Index::d2(0, 0)) {
                        rt.migrate(grid, Index::d2(0, 0), 2);
                    }
                });
                rt.wait_epoch(moved).await?;
                if let Some(residual) = solve(&mut rt, &h, grid, 3).await? {
                    *out.lock().unwrap() = Some(residual);
                }
                rt.finalize().await
            }
        })
        .await
        .unwrap();
        let residual = found.lock().unwrap().expect("root saw no residual");
        assert!((residual - reference(4, 6)).abs() < 1e-12);
    }
}
