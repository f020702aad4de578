//! Distribution policies: map a logical (offset, length) range onto
//! per-server stripes. Deterministic; same inputs yield the same sequence.

/// How object bytes spread across the object servers.
#[derive(Clone, Debug)]
pub enum DistributionPolicy {
    /// Everything on one fixed server.
    SingleServer { server: usize },
    /// Fixed-size stripes cycling over all servers.
    RoundRobin { stripe_size: u64 },
    /// Like round-robin, with a per-server stripe size.
    Weighted { stripe_sizes: Vec<u64> },
}

/// An armed stripe iterator. `reset` arms it for one logical range;
/// repeated `next` yields `(server, local_offset, local_length)` triples
/// covering the range exactly once, in ascending logical order.
pub struct Distribution {
    policy: DistributionPolicy,
    server_count: usize,
    offset: u64,
    remaining: u64,
}

impl Distribution {
    pub fn new(policy: DistributionPolicy, server_count: usize) -> Self {
        assert!(server_count > 0, "a distribution needs at least one server");

        if let DistributionPolicy::Weighted { stripe_sizes } = &policy {
            assert_eq!(stripe_sizes.len(), server_count);
            assert!(stripe_sizes.iter().all(|size| *size > 0));
        }

        Self {
            policy,
            server_count,
            offset: 0,
            remaining: 0,
        }
    }

    pub fn reset(&mut self, length: u64, offset: u64) {
        self.offset = offset;
        self.remaining = length;
    }

    pub fn next(&mut self) -> Option<(usize, u64, u64)> {
        if self.remaining == 0 {
            return None;
        }

        let (server, local_offset, stripe_remaining) = match &self.policy {
            DistributionPolicy::SingleServer { server } => {
                (*server, self.offset, self.remaining)
            }
            DistributionPolicy::RoundRobin { stripe_size } => {
                let block = self.offset / stripe_size;
                let in_stripe = self.offset % stripe_size;
                let server = (block as usize) % self.server_count;
                let local_offset = (block / self.server_count as u64) * stripe_size + in_stripe;
                (server, local_offset, stripe_size - in_stripe)
            }
            DistributionPolicy::Weighted { stripe_sizes } => {
                let cycle: u64 = stripe_sizes.iter().sum();
                let in_cycle = self.offset % cycle;

                let mut cumulative = 0;
                let mut server = 0;
                for (index, size) in stripe_sizes.iter().enumerate() {
                    if in_cycle < cumulative + size {
                        server = index;
                        break;
                    }
                    cumulative += size;
                }

                let in_stripe = in_cycle - cumulative;
                let local_offset =
                    (self.offset / cycle) * stripe_sizes[server] + in_stripe;
                (server, local_offset, stripe_sizes[server] - in_stripe)
            }
        };

        let length = self.remaining.min(stripe_remaining);
        self.offset += length;
        self.remaining -= length;

        Some((server, local_offset, length))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(mut distribution: Distribution, length: u64, offset: u64) -> Vec<(usize, u64, u64)> {
        distribution.reset(length, offset);
        let mut stripes = Vec::new();
        while let Some(stripe) = distribution.next() {
            stripes.push(stripe);
        }
        stripes
    }

    #[test]
    fn single_server_yields_one_stripe() {
        let stripes = collect(
            Distribution::new(DistributionPolicy::SingleServer { server: 2 }, 4),
            4096,
            123,
        );
        assert_eq!(stripes, vec![(2, 123, 4096)]);
    }

    #[test]
    fn round_robin_walks_servers() {
        // 2560 bytes at offset 512 over three servers with 1 KiB stripes.
        let stripes = collect(
            Distribution::new(DistributionPolicy::RoundRobin { stripe_size: 1024 }, 3),
            2560,
            512,
        );
        assert_eq!(
            stripes,
            vec![(0, 512, 512), (1, 0, 1024), (2, 0, 1024)]
        );
    }

    #[test]
    fn round_robin_wraps_into_later_cycles() {
        let stripes = collect(
            Distribution::new(DistributionPolicy::RoundRobin { stripe_size: 100 }, 2),
            450,
            0,
        );
        assert_eq!(
            stripes,
            vec![
                (0, 0, 100),
                (1, 0, 100),
                (0, 100, 100),
                (1, 100, 100),
                (0, 200, 50)
            ]
        );
    }

    #[test]
    fn stripes_cover_the_range_exactly_once() {
        for (length, offset) in [(1u64, 0u64), (1023, 1), (4096, 4095), (65536, 12345)] {
            let stripes = collect(
                Distribution::new(DistributionPolicy::RoundRobin { stripe_size: 1024 }, 3),
                length,
                offset,
            );

            let total: u64 = stripes.iter().map(|(_, _, len)| len).sum();
            assert_eq!(total, length);

            // Ascending logical order: lengths partition [offset, offset+length).
            let mut logical = offset;
            let mut last: Option<(usize, u64)> = None;
            for (server, local_offset, len) in stripes {
                if let Some((previous_server, previous_offset)) = last {
                    assert!(
                        server != previous_server || local_offset > previous_offset,
                        "stripes must advance"
                    );
                }
                last = Some((server, local_offset));
                logical += len;
            }
            assert_eq!(logical, offset + length);
        }
    }

    #[test]
    fn weighted_respects_per_server_sizes() {
        let stripes = collect(
            Distribution::new(
                DistributionPolicy::Weighted {
                    stripe_sizes: vec![100, 300],
                },
                2,
            ),
            800,
            0,
        );
        assert_eq!(
            stripes,
            vec![(0, 0, 100), (1, 0, 300), (0, 100, 100), (1, 300, 300)]
        );
    }

    #[test]
    fn weighted_mid_stripe_offset() {
        let stripes = collect(
            Distribution::new(
                DistributionPolicy::Weighted {
                    stripe_sizes: vec![100, 300],
                },
                2,
            ),
            350,
            150,
        );
        // Offset 150 lands inside server 1's first stripe.
        assert_eq!(stripes, vec![(1, 50, 250), (0, 100, 100)]);
    }
}
