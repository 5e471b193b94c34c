//! Model clock with output scheduling.

/// Relative slack, in units of `dt`, when comparing model times.
const TIME_EPS: f64 = 1.0e-9;

/// Current time of the run and the next output time.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationClock {
    time: f64,
    end: f64,
    dt: f64,
    tout: f64,
    next_output: f64,
    step: usize,
}

impl SimulationClock {
    pub fn new(start: f64, end: f64, dt: f64, tout: f64) -> Self {
        Self {
            time: start,
            end,
            dt,
            tout,
            next_output: start + tout,
            step: 0,
        }
    }

    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Configured step length.
    #[inline]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Length of the next step: `dt`, or the remainder of the window when
    /// less than `dt` is left.
    pub fn next_dt(&self) -> f64 {
        let remaining = self.end - self.time;
        if remaining <= self.dt * (1.0 + TIME_EPS) {
            remaining.max(0.0)
        } else {
            self.dt
        }
    }

    /// Number of completed steps.
    #[inline]
    pub fn step(&self) -> usize {
        self.step
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.end - self.time <= TIME_EPS * self.dt
    }

    /// Advance by [`next_dt`](Self::next_dt); the final step lands exactly
    /// on the end of the window. Returns true when an output time was reached.
    pub fn advance(&mut self) -> bool {
        let last = self.end - self.time <= self.dt * (1.0 + TIME_EPS);
        self.step += 1;
        self.time = if last { self.end } else { self.time + self.dt };
        if self.time + TIME_EPS * self.dt >= self.next_output || self.is_finished() {
            while self.next_output <= self.time + TIME_EPS * self.dt {
                self.next_output += self.tout;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_every_other_step() {
        let mut clock = SimulationClock::new(0.0, 4.0, 1.0, 2.0);
        let due: Vec<bool> = (0..4).map(|_| clock.advance()).collect();
        assert_eq!(due, vec![false, true, false, true]);
        assert!(clock.is_finished());
        assert_eq!(clock.step(), 4);
    }

    #[test]
    fn last_partial_step_stops_at_end() {
        let mut clock = SimulationClock::new(0.0, 2.5, 1.0, 10.0);
        clock.advance();
        clock.advance();
        assert!(clock.advance(), "end of run is an output time");
        assert_eq!(clock.time(), 2.5);
    }

    #[test]
    fn short_final_step_reports_its_length() {
        let mut clock = SimulationClock::new(0.0, 2500.0, 1000.0, 1000.0);
        let mut steps = Vec::new();
        let mut times = Vec::new();
        while !clock.is_finished() {
            steps.push(clock.next_dt());
            clock.advance();
            times.push(clock.time());
        }
        assert_eq!(steps, vec![1000.0, 1000.0, 500.0]);
        assert_eq!(times, vec![1000.0, 2000.0, 2500.0]);
        assert_eq!(clock.next_dt(), 0.0);
    }

    #[test]
    fn window_shorter_than_dt_takes_one_short_step() {
        let mut clock = SimulationClock::new(0.0, 500.0, 1000.0, 1000.0);
        assert_eq!(clock.next_dt(), 500.0);
        assert!(clock.advance());
        assert!(clock.is_finished());
        assert_eq!(clock.time(), 500.0);
    }
}
