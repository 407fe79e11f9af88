//! CUDA C source for the Expected Improvement kernels.
//!
//! Thread `t` of the grid owns Philox stream `(seed, t)` and performs
//! `draws_per_thread` Monte-Carlo draws, each consuming `num_union` normals.
//! With externally supplied draws, thread `t` reads draw `k` from offset
//! `(t * draws_per_thread + k) * num_union`. Each block reduces its threads in
//! shared memory and writes one partial sum per output slot; the host adds the
//! block partials.

/// Function name of the EI kernel.
pub const EI_KERNEL: &str = "ei_kernel";

/// Function name of the gradient kernel.
pub const GRAD_EI_KERNEL: &str = "grad_ei_kernel";

/// CUDA kernel source, compiled with NVRTC at activation.
pub const EI_KERNEL_SOURCE: &str = r#"
// Philox4x32-10 constants
#define PHILOX_M0 0xD2511F53u
#define PHILOX_M1 0xCD9E8D57u
#define PHILOX_W0 0x9E3779B9u
#define PHILOX_W1 0xBB67AE85u

#define TWO_POW_MINUS_53 1.1102230246251565e-16
#define TWO_PI 6.283185307179586

struct philox_stream {
    unsigned int ctr[4];
    unsigned int key[2];
    unsigned int buf[4];
    int idx;
};

__device__ void philox_round(unsigned int* ctr, const unsigned int* key) {
    unsigned int lo0 = PHILOX_M0 * ctr[0];
    unsigned int hi0 = __umulhi(PHILOX_M0, ctr[0]);
    unsigned int lo1 = PHILOX_M1 * ctr[2];
    unsigned int hi1 = __umulhi(PHILOX_M1, ctr[2]);

    ctr[0] = hi1 ^ ctr[1] ^ key[0];
    ctr[1] = lo1;
    ctr[2] = hi0 ^ ctr[3] ^ key[1];
    ctr[3] = lo0;
}

__device__ void philox_init(philox_stream* s, unsigned long long seed, unsigned long long stream) {
    s->ctr[0] = 0; s->ctr[1] = 0;
    s->ctr[2] = (unsigned int)(stream & 0xFFFFFFFFull);
    s->ctr[3] = (unsigned int)(stream >> 32);
    s->key[0] = (unsigned int)(seed & 0xFFFFFFFFull);
    s->key[1] = (unsigned int)(seed >> 32);
    s->idx = 4;
}

__device__ unsigned int philox_next_u32(philox_stream* s) {
    if (s->idx >= 4) {
        unsigned int ctr[4] = {s->ctr[0], s->ctr[1], s->ctr[2], s->ctr[3]};
        unsigned int key[2] = {s->key[0], s->key[1]};
        for (int round = 0; round < 9; ++round) {
            philox_round(ctr, key);
            key[0] += PHILOX_W0;
            key[1] += PHILOX_W1;
        }
        philox_round(ctr, key);
        s->buf[0] = ctr[0]; s->buf[1] = ctr[1]; s->buf[2] = ctr[2]; s->buf[3] = ctr[3];
        s->idx = 0;

        // 128-bit counter increment
        if (++s->ctr[0] == 0 && ++s->ctr[1] == 0 && ++s->ctr[2] == 0) {
            ++s->ctr[3];
        }
    }
    return s->buf[s->idx++];
}

// Uniform in (0, 1]
__device__ double philox_open_uniform(philox_stream* s) {
    unsigned long long hi = philox_next_u32(s);
    unsigned long long lo = philox_next_u32(s);
    unsigned long long bits = (hi << 32) | lo;
    return (double)((bits >> 11) + 1ull) * TWO_POW_MINUS_53;
}

// Box-Muller, cosine branch only: two uniforms per normal
__device__ double philox_normal(philox_stream* s) {
    double u1 = philox_open_uniform(s);
    double u2 = philox_open_uniform(s);
    return sqrt(-2.0 * log(u1)) * cos(TWO_PI * u2);
}

__device__ void next_draw(
    philox_stream* s,
    const double* random_numbers,
    int use_fixed,
    unsigned long long offset,
    double* normals,
    unsigned int num_union
) {
    for (unsigned int i = 0; i < num_union; ++i) {
        normals[i] = use_fixed ? random_numbers[offset + i] : philox_normal(s);
    }
}

// Improvement of y = mu + L z; writes the arg-min to *winner, -1 if none
__device__ double sample_improvement(
    const double* mu,
    const double* chol,
    const double* normals,
    unsigned int num_union,
    double best_so_far,
    int* winner
) {
    double min_value = 1.7976931348623157e308;
    int argmin = -1;
    for (unsigned int i = 0; i < num_union; ++i) {
        double value = mu[i];
        for (unsigned int j = 0; j <= i; ++j) {
            value += chol[i * num_union + j] * normals[j];
        }
        if (value < min_value) {
            min_value = value;
            argmin = (int)i;
        }
    }
    double improvement = best_so_far - min_value;
    if (improvement > 0.0) {
        *winner = argmin;
        return improvement;
    }
    *winner = -1;
    return 0.0;
}

// Sum over the block; valid for any block size. Result lands in shared[0].
__device__ void block_reduce_sum(double val, double* shared) {
    unsigned int tid = threadIdx.x;
    shared[tid] = val;
    __syncthreads();

    for (unsigned int stride = 1; stride < blockDim.x; stride <<= 1) {
        if ((tid % (2 * stride)) == 0 && tid + stride < blockDim.x) {
            shared[tid] += shared[tid + stride];
        }
        __syncthreads();
    }
}

extern "C" __global__ void ei_kernel(
    const double* mu,
    const double* chol,
    double* ei_storage,
    const double* random_numbers,
    double* scratch,
    int use_fixed,
    unsigned int num_union,
    unsigned int draws_per_thread,
    double best_so_far,
    unsigned long long seed
) {
    extern __shared__ double shared[];
    unsigned long long t = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    double* normals = scratch + t * num_union;

    philox_stream stream;
    philox_init(&stream, seed, t);

    double sum = 0.0;
    int winner;
    for (unsigned int k = 0; k < draws_per_thread; ++k) {
        unsigned long long offset = (t * draws_per_thread + k) * num_union;
        next_draw(&stream, random_numbers, use_fixed, offset, normals, num_union);
        sum += sample_improvement(mu, chol, normals, num_union, best_so_far, &winner);
    }

    block_reduce_sum(sum, shared);
    if (threadIdx.x == 0) {
        ei_storage[blockIdx.x] = shared[0];
    }
}

extern "C" __global__ void grad_ei_kernel(
    const double* mu,
    const double* chol,
    const double* grad_mu,
    const double* grad_chol,
    double* grad_ei_storage,
    const double* random_numbers,
    double* scratch,
    int use_fixed,
    unsigned int num_union,
    unsigned int num_to_sample,
    unsigned int dim,
    unsigned int draws_per_thread,
    double best_so_far,
    unsigned long long seed
) {
    extern __shared__ double shared[];
    unsigned int slots = num_to_sample * dim;
    unsigned long long t = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    double* normals = scratch + t * (num_union + slots);
    double* grad = normals + num_union;

    for (unsigned int s = 0; s < slots; ++s) {
        grad[s] = 0.0;
    }

    philox_stream stream;
    philox_init(&stream, seed, t);

    int winner;
    for (unsigned int k = 0; k < draws_per_thread; ++k) {
        unsigned long long offset = (t * draws_per_thread + k) * num_union;
        next_draw(&stream, random_numbers, use_fixed, offset, normals, num_union);
        sample_improvement(mu, chol, normals, num_union, best_so_far, &winner);
        if (winner < 0) {
            continue;
        }

        unsigned int w = (unsigned int)winner;
        for (unsigned int s = 0; s < slots; ++s) {
            const double* row = grad_chol + ((unsigned long long)s * num_union + w) * num_union;
            double dy = 0.0;
            for (unsigned int j = 0; j <= w; ++j) {
                dy += row[j] * normals[j];
            }
            if (s / dim == w) {
                dy += grad_mu[s];
            }
            grad[s] -= dy;
        }
    }

    for (unsigned int s = 0; s < slots; ++s) {
        block_reduce_sum(grad[s], shared);
        if (threadIdx.x == 0) {
            grad_ei_storage[blockIdx.x * slots + s] = shared[0];
        }
        __syncthreads();
    }
}
"#;
