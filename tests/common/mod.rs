//! Simulated data sets shared by the integration tests.
#![allow(dead_code)]

use std::f64::consts::PI;

use binomrs::frame::Frame;
use binomrs::model::expit;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution, Normal, Uniform};

pub const INTERCEPT: f64 = 1.0;
pub const SLOPE: f64 = 2.0;

fn draw_successes(rng: &mut SmallRng, p: &[f64], trials: u64) -> Vec<f64> {
    p.iter()
        .map(|&p| Binomial::new(trials, p).unwrap().sample(rng) as f64)
        .collect()
}

fn standard_normal(rng: &mut SmallRng, n: usize) -> Vec<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..n).map(|_| normal.sample(rng)).collect()
}

/// `success ~ Binomial(trials, expit(1 + 2 x1))` with `x1 ~ N(0, 1)`.
pub fn linear_frame(n: usize, trials: u64, seed: u64) -> Frame {
    let mut rng = SmallRng::seed_from_u64(seed);
    let x = standard_normal(&mut rng, n);
    let p: Vec<f64> = x.iter().map(|x| expit(INTERCEPT + SLOPE * x)).collect();
    let success = draw_successes(&mut rng, &p, trials);
    Frame::new()
        .with_column("success", success)
        .unwrap()
        .with_column("total", vec![trials as f64; n])
        .unwrap()
        .with_column("p", p)
        .unwrap()
        .with_column("x1", x)
        .unwrap()
}

/// `success ~ Binomial(trials, expit(sin x1))` with `x1 ~ U(0, pi)`.
pub fn concave_frame(n: usize, trials: u64, seed: u64) -> Frame {
    let mut rng = SmallRng::seed_from_u64(seed);
    let uniform = Uniform::new(0.0, PI);
    let x: Vec<f64> = (0..n).map(|_| uniform.sample(&mut rng)).collect();
    let p: Vec<f64> = x.iter().map(|x| expit(x.sin())).collect();
    let success = draw_successes(&mut rng, &p, trials);
    Frame::new()
        .with_column("success", success)
        .unwrap()
        .with_column("total", vec![trials as f64; n])
        .unwrap()
        .with_column("p", p)
        .unwrap()
        .with_column("x1", x)
        .unwrap()
}

/// Equal-sized groups `g = 0..n_groups` with random intercept offsets
/// `u ~ N(0, 1)`: `success ~ Binomial(trials, expit(1 + 2 x1 + u_g))`.
pub fn group_frame(n: usize, n_groups: usize, trials: u64, seed: u64) -> Frame {
    let mut rng = SmallRng::seed_from_u64(seed);
    let x = standard_normal(&mut rng, n);
    let offsets = standard_normal(&mut rng, n_groups);
    let per_group = n / n_groups;
    let g: Vec<i64> = (0..n).map(|i| (i / per_group) as i64).collect();
    let u: Vec<f64> = g.iter().map(|&g| offsets[g as usize]).collect();
    let p: Vec<f64> = x
        .iter()
        .zip(u.iter())
        .map(|(x, u)| expit(INTERCEPT + SLOPE * x + u))
        .collect();
    let success = draw_successes(&mut rng, &p, trials);
    Frame::new()
        .with_column("success", success)
        .unwrap()
        .with_column("total", vec![trials as f64; n])
        .unwrap()
        .with_column("p", p)
        .unwrap()
        .with_column("x1", x)
        .unwrap()
        .with_column("g", g)
        .unwrap()
        .with_column("u", u)
        .unwrap()
}

pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}
