//! Jacobi-preconditioned conjugate gradients

use lidarmesh_core::{chunked_sum, Error, Result};
use rayon::prelude::*;

/// A symmetric positive definite operator applied without storing a matrix
pub trait LinearOperator: Sync {
    /// Number of unknowns
    fn dim(&self) -> usize;

    /// `y = A x`
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// Diagonal of `A`, used as the preconditioner
    fn diagonal(&self) -> Vec<f64>;
}

/// Stopping rule for [`conjugate_gradient`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgSettings {
    /// Target for `|r| / |b|`
    pub tolerance: f64,
    pub max_iterations: usize,
    /// `interrupt` is polled every this many iterations
    pub check_interval: usize,
}

impl Default for CgSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 1000,
            check_interval: 16,
        }
    }
}

/// Outcome of a solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgStats {
    pub iterations: usize,
    /// `|r| / |b|` at exit
    pub relative_residual: f64,
    pub converged: bool,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    chunked_sum(a.len(), |i| a[i] * b[i])
}

/// Solve `A x = b` starting from the contents of `x`
///
/// Dot products use a fixed reduction order, so the iterates are identical
/// across runs and thread counts. `interrupt` is polled periodically and
/// aborts the solve with its error. A breakdown (non-positive curvature or
/// a non-finite residual) is reported as `Error::Reconstruction`.
pub fn conjugate_gradient<A, F>(
    op: &A,
    b: &[f64],
    x: &mut [f64],
    settings: &CgSettings,
    mut interrupt: F,
) -> Result<CgStats>
where
    A: LinearOperator,
    F: FnMut() -> Result<()>,
{
    let n = op.dim();
    if b.len() != n || x.len() != n {
        return Err(Error::Reconstruction(format!(
            "solver dimension mismatch: operator {}, rhs {}, initial guess {}",
            n,
            b.len(),
            x.len()
        )));
    }

    let b_norm = dot(b, b).sqrt();
    if b_norm == 0.0 {
        x.par_iter_mut().for_each(|v| *v = 0.0);
        return Ok(CgStats {
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
        });
    }

    let inv_diag: Vec<f64> = op
        .diagonal()
        .into_par_iter()
        .map(|d| if d > 0.0 { 1.0 / d } else { 1.0 })
        .collect();

    let mut r = vec![0.0; n];
    op.apply(x, &mut r);
    r.par_iter_mut().zip(b.par_iter()).for_each(|(r, b)| *r = b - *r);

    let mut z: Vec<f64> = r.par_iter().zip(inv_diag.par_iter()).map(|(r, d)| r * d).collect();
    let mut p = z.clone();
    let mut ap = vec![0.0; n];
    let mut rz = dot(&r, &z);
    let mut residual = dot(&r, &r).sqrt() / b_norm;

    let mut iterations = 0;
    while residual > settings.tolerance && iterations < settings.max_iterations {
        if settings.check_interval > 0 && iterations % settings.check_interval == 0 {
            interrupt()?;
        }

        op.apply(&p, &mut ap);
        let curvature = dot(&p, &ap);
        if !(curvature > 0.0) || !curvature.is_finite() {
            return Err(Error::Reconstruction(format!(
                "conjugate gradient breakdown after {} iterations (curvature {})",
                iterations, curvature
            )));
        }

        let alpha = rz / curvature;
        x.par_iter_mut().zip(p.par_iter()).for_each(|(x, p)| *x += alpha * p);
        r.par_iter_mut().zip(ap.par_iter()).for_each(|(r, ap)| *r -= alpha * ap);
        z.par_iter_mut()
            .zip(r.par_iter().zip(inv_diag.par_iter()))
            .for_each(|(z, (r, d))| *z = r * d);

        let rz_next = dot(&r, &z);
        let beta = rz_next / rz;
        rz = rz_next;
        p.par_iter_mut().zip(z.par_iter()).for_each(|(p, z)| *p = z + beta * *p);

        residual = dot(&r, &r).sqrt() / b_norm;
        iterations += 1;

        if !residual.is_finite() {
            return Err(Error::Reconstruction(format!(
                "solver residual became non-finite after {} iterations",
                iterations
            )));
        }
    }

    Ok(CgStats {
        iterations,
        relative_residual: residual,
        converged: residual <= settings.tolerance,
    })
}
