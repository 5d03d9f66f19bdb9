use std::{future::Future, sync::Arc};

use futures::stream::{self, StreamExt};
use tokio::{
	sync::Semaphore,
	task::{self, JoinHandle},
	time::{self, Duration},
};

/// Upper bound for tickets piling up while the client is idle.
const MAX_BURST: usize = 10_000;

/// Time between two new tickets, never zero.
fn refill_period(rate: usize) -> Duration {
	Duration::from_secs_f64(60.0 / rate as f64).max(Duration::from_nanos(1))
}

/// Request rate limiter: one ticket per request, refilled on an interval.
pub struct RequestTickets {
	tickets: Option<Arc<Semaphore>>,
	refill: Option<JoinHandle<()>>,
}

impl RequestTickets {
	/// `rate` is given in requests per minute, `0` disables the limit.
	/// Must be called from within a tokio runtime.
	pub fn new(rate: usize) -> Self {
		if rate == 0 {
			return RequestTickets {
				tickets: None,
				refill: None,
			};
		}
		let tickets = Arc::new(Semaphore::new(0));
		let burst = rate.min(MAX_BURST);
		let refill = {
			let tickets = Arc::clone(&tickets);
			task::spawn(async move {
				let mut interval = time::interval(refill_period(rate));
				loop {
					interval.tick().await;
					// don't let an idle client build up an unbounded burst
					if tickets.available_permits() < burst {
						tickets.add_permits(1);
					}
				}
			})
		};
		RequestTickets {
			tickets: Some(tickets),
			refill: Some(refill),
		}
	}

	pub async fn get(&self) {
		if let Some(tickets) = self.tickets.as_ref() {
			if let Ok(permit) = tickets.acquire().await {
				permit.forget();
			}
		}
	}
}

impl Drop for RequestTickets {
	fn drop(&mut self) {
		if let Some(refill) = self.refill.take() {
			refill.abort();
		}
	}
}

/// Runs `work` on every item, at most `jobs` at once.
/// Results are collected in completion order.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, jobs: usize, work: F) -> Vec<R>
where
	F: Fn(T) -> Fut,
	Fut: Future<Output = R>,
{
	stream::iter(items).map(work).buffer_unordered(jobs.max(1)).collect().await
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn never_exceeds_job_limit() {
		let in_flight = AtomicUsize::new(0);
		let max = AtomicUsize::new(0);
		let results = run_bounded((0..20).collect(), 3, |i: usize| {
			let (in_flight, max) = (&in_flight, &max);
			async move {
				let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
				max.fetch_max(now, Ordering::SeqCst);
				for _ in 0..(i % 4) {
					task::yield_now().await;
				}
				in_flight.fetch_sub(1, Ordering::SeqCst);
				i * 2
			}
		})
		.await;
		assert_eq!(max.load(Ordering::SeqCst), 3);
		let mut results = results;
		results.sort_unstable();
		assert_eq!(results, (0..20).map(|i| i * 2).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn handles_empty_input_and_zero_jobs() {
		let none: Vec<u8> = run_bounded(Vec::<u8>::new(), 3, |x| async move { x }).await;
		assert!(none.is_empty());
		let all = run_bounded(vec![1, 2, 3], 0, |x| async move { x + 1 }).await;
		assert_eq!(all, vec![2, 3, 4]);
	}

	#[tokio::test]
	async fn results_follow_completion_order() {
		let results = run_bounded(vec![3usize, 0, 1], 3, |delay| async move {
			for _ in 0..delay * 2 {
				task::yield_now().await;
			}
			delay
		})
		.await;
		assert_eq!(results, vec![0, 1, 3]);
	}

	#[test]
	fn refill_period_is_never_zero() {
		assert_eq!(refill_period(60), Duration::from_secs(1));
		assert!(refill_period(usize::MAX) > Duration::from_secs(0));
	}

	#[tokio::test]
	async fn huge_rates_hand_out_tickets() {
		let tickets = RequestTickets::new(usize::MAX);
		time::timeout(Duration::from_secs(5), tickets.get())
			.await
			.expect("no ticket for an unlimited-looking rate");
	}

	#[tokio::test]
	async fn unlimited_tickets_never_block() {
		let tickets = RequestTickets::new(0);
		for _ in 0..100 {
			tickets.get().await;
		}
	}

	#[tokio::test]
	async fn tickets_are_handed_out_over_time() {
		let tickets = RequestTickets::new(6000);
		time::timeout(time::Duration::from_secs(5), async {
			for _ in 0..3 {
				tickets.get().await;
			}
		})
		.await
		.expect("tickets were not refilled");
	}
}
