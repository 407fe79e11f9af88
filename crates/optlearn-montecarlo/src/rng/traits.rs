//! Uniform to standard-normal conversion.

/// Source of uniform draws with a Box-Muller standard-normal transform.
///
/// One normal consumes exactly two uniforms (the cosine branch only), so a
/// stream of `n` normals always advances the generator by `2n` uniforms. The
/// device kernels rely on this fixed stride.
pub trait NormalSource {
    /// Next uniform in the half-open interval (0, 1].
    fn next_open_uniform(&mut self) -> f64;

    /// Next standard normal variate.
    fn next_normal(&mut self) -> f64 {
        let u1 = self.next_open_uniform();
        let u2 = self.next_open_uniform();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        r * theta.cos()
    }

    /// Fill `out` with standard normal variates.
    fn fill_normal(&mut self, out: &mut [f64]) {
        for z in out.iter_mut() {
            *z = self.next_normal();
        }
    }
}
